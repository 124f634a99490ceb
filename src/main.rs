use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use usage_report::billing::BillingSummary;
use usage_report::config::{ensure_initialized, load_config};
use usage_report::error::AppError;
use usage_report::integrator::now_millis;
use usage_report::models::{parse_timestamp_str, TimeSeries, TimeWindow, UsageResult, WindowPreset};
use usage_report::service::{IntegralReport, ReportService};
use usage_report::sources::{project_query, RecordKind};
use usage_report::ResourceDimension;

#[derive(Debug, Parser)]
#[command(name = "usage-report")]
#[command(about = "Resource-hour usage and billing reports")]
struct Cli {
    /// Current time override (RFC 3339, date, or epoch ms)
    #[arg(long, global = true)]
    now: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct SourceArgs {
    /// Report JSON file to read instead of querying the reporting API
    #[arg(long, conflicts_with = "project")]
    input: Option<PathBuf>,
    #[arg(long)]
    project: Option<String>,
    #[arg(long, default_value = "instance")]
    kind: String,
}

#[derive(Debug, Args)]
struct WindowArgs {
    #[arg(long, default_value = "month")]
    window: String,
    #[arg(long, requires = "end")]
    start: Option<String>,
    /// Window end; a bare date includes that whole day
    #[arg(long, requires = "start")]
    end: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init,
    Usage {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        window: WindowArgs,
        #[arg(long, value_delimiter = ',')]
        dimensions: Vec<String>,
        #[arg(long, default_value = "json")]
        format: String,
    },
    Series {
        #[command(flatten)]
        source: SourceArgs,
        #[arg(long, value_delimiter = ',')]
        dimensions: Vec<String>,
        /// Do not append the trailing "now" point
        #[arg(long)]
        no_now: bool,
        #[arg(long, default_value = "json")]
        format: String,
    },
    Integrate {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        window: WindowArgs,
        #[arg(long, value_delimiter = ',')]
        dimensions: Vec<String>,
        #[arg(long, default_value = "json")]
        format: String,
    },
    Bill {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        window: WindowArgs,
        /// Price per service-unit hour (defaults to su_price from config)
        #[arg(long)]
        price: Option<f64>,
        #[arg(long)]
        months: Option<u32>,
        #[arg(long, default_value = "json")]
        format: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Json,
    Csv,
}

fn validate_format(input: &str) -> Result<OutputFormat, AppError> {
    if input.eq_ignore_ascii_case("json") {
        Ok(OutputFormat::Json)
    } else if input.eq_ignore_ascii_case("csv") {
        Ok(OutputFormat::Csv)
    } else {
        Err(AppError::Config(
            "Unsupported output format. Use json or csv".into(),
        ))
    }
}

fn validate_window(input: &str) -> Result<WindowPreset, AppError> {
    WindowPreset::from_label(input).ok_or_else(|| {
        AppError::Config("Unsupported window. Use 1d, 7d, 30d, or month.".into())
    })
}

/// Reference time in epoch ms; the wall clock unless `--now` is given.
fn parse_now(raw: Option<&str>) -> Result<i64, AppError> {
    match raw {
        None => Ok(now_millis()),
        Some(raw) => parse_timestamp_str(raw)
            .map(|ts| ts.timestamp_millis())
            .ok_or_else(|| AppError::Config(format!("Invalid --now value '{raw}'."))),
    }
}

/// A bare date as window end means the whole day, so the window runs to
/// 00:00 of the following day.
fn parse_bound(raw: &str, is_end: bool) -> Result<i64, AppError> {
    if is_end {
        if let Ok(date) = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d") {
            if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
                return Ok((Utc.from_utc_datetime(&midnight) + Duration::days(1)).timestamp_millis());
            }
        }
    }
    parse_timestamp_str(raw)
        .map(|ts| ts.timestamp_millis())
        .ok_or_else(|| AppError::Config(format!("Invalid timestamp '{raw}'.")))
}

fn resolve_window(args: &WindowArgs, now: DateTime<Utc>) -> Result<TimeWindow, AppError> {
    if let (Some(start), Some(end)) = (&args.start, &args.end) {
        return Ok(TimeWindow::new(
            parse_bound(start, false)?,
            parse_bound(end, true)?,
        ));
    }
    validate_window(&args.window)?
        .resolve(now)
        .ok_or_else(|| AppError::Config("Window is out of range.".into()))
}

fn report_query(source: &SourceArgs) -> Result<String, AppError> {
    let kind = RecordKind::from_label(&source.kind).ok_or_else(|| {
        AppError::Config("Unsupported record kind. Use instance or volume.".into())
    })?;
    match (&source.input, &source.project) {
        (Some(_), _) => Ok(kind.report_name().to_string()),
        (None, Some(project)) => Ok(project_query(kind, project)),
        (None, None) => Err(AppError::Config(
            "Provide --input <file> or --project <id>.".into(),
        )),
    }
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn usage_csv(usage: &UsageResult, dimensions: &[ResourceDimension]) -> String {
    let mut out = String::from("id,hours");
    for d in dimensions {
        out.push(',');
        out.push_str(&csv_field(d.key()));
    }
    out.push('\n');

    for entry in &usage.working_set {
        out.push_str(&format!("{},{:.6}", csv_field(&entry.record.id), entry.hours));
        for d in dimensions {
            out.push_str(&format!(",{:.6}", entry.hours * d.per_unit_value(&entry.record)));
        }
        out.push('\n');
    }

    let hours: f64 = usage.working_set.iter().map(|w| w.hours).sum();
    out.push_str(&format!("total,{hours:.6}"));
    for d in dimensions {
        let total = usage.totals.get(d.key()).copied().unwrap_or(0.0);
        out.push_str(&format!(",{total:.6}"));
    }
    out.push('\n');
    out
}

fn series_csv(series: &TimeSeries) -> String {
    let mut out = String::from("time");
    for key in &series.dimensions {
        out.push(',');
        out.push_str(&csv_field(key));
    }
    out.push_str(",synthetic\n");
    for point in &series.points {
        out.push_str(&point.time.to_string());
        for key in &series.dimensions {
            let value = point.values.get(key).copied().unwrap_or(0.0);
            out.push_str(&format!(",{value}"));
        }
        out.push_str(&format!(",{}\n", point.synthetic));
    }
    out
}

fn integral_csv(report: &IntegralReport) -> String {
    let mut out = String::from("dimension,resource_hours\n");
    for (key, hours) in &report.resource_hours {
        out.push_str(&format!("{},{hours:.6}\n", csv_field(key)));
    }
    out
}

fn bill_csv(summary: &BillingSummary) -> String {
    let mut out = String::from("period,start,end,su_hours,cost\n");
    for month in &summary.history {
        out.push_str(&format!(
            "{},{},{},{:.6},{:.2}\n",
            month.month,
            month.window.start,
            month.window.end,
            month.su_hours,
            month.su_hours * summary.price
        ));
    }
    out.push_str(&format!(
        "window,{},{},{:.6},{:.2}\n",
        summary.window.start, summary.window.end, summary.su_hours, summary.cost
    ));
    out
}

fn emit<T: serde::Serialize>(
    format: OutputFormat,
    value: &T,
    csv: impl FnOnce(&T) -> String,
) -> Result<(), AppError> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Csv => print!("{}", csv(value)),
    }
    Ok(())
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    init_logging();
    let cli = Cli::parse();
    let now_ms = parse_now(cli.now.as_deref())?;
    let now = DateTime::<Utc>::from_timestamp_millis(now_ms)
        .ok_or_else(|| AppError::Config("--now is out of range.".into()))?;

    match cli.command {
        Commands::Init => {
            let path = ensure_initialized()?;
            println!("Initialized usage-report config at {}", path.display());
        }
        Commands::Usage {
            source,
            window,
            dimensions,
            format,
        } => {
            let format = validate_format(&format)?;
            let window = resolve_window(&window, now)?;
            let query = report_query(&source)?;
            let cfg = load_config()?;
            let svc = ReportService::from_config(&cfg, source.input.as_deref(), &dimensions)?;
            let usage = svc.usage(&query, window, now_ms).await?;
            emit(format, &usage, |u| usage_csv(u, svc.dimensions()))?;
        }
        Commands::Series {
            source,
            dimensions,
            no_now,
            format,
        } => {
            let format = validate_format(&format)?;
            let query = report_query(&source)?;
            let cfg = load_config()?;
            let svc = ReportService::from_config(&cfg, source.input.as_deref(), &dimensions)?;
            let series = svc
                .series(&query, if no_now { None } else { Some(now_ms) })
                .await?;
            emit(format, &series, series_csv)?;
        }
        Commands::Integrate {
            source,
            window,
            dimensions,
            format,
        } => {
            let format = validate_format(&format)?;
            let window = resolve_window(&window, now)?;
            let query = report_query(&source)?;
            let cfg = load_config()?;
            let svc = ReportService::from_config(&cfg, source.input.as_deref(), &dimensions)?;
            let report = svc.integrate(&query, window, now_ms).await?;
            emit(format, &report, integral_csv)?;
        }
        Commands::Bill {
            source,
            window,
            price,
            months,
            format,
        } => {
            let format = validate_format(&format)?;
            let window = resolve_window(&window, now)?;
            let query = report_query(&source)?;
            let cfg = load_config()?;
            let svc = ReportService::from_config(&cfg, source.input.as_deref(), &[])?;
            let summary = svc.bill(&query, window, price, months, now_ms).await?;
            emit(format, &summary, bill_csv)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window_args(window: &str, start: Option<&str>, end: Option<&str>) -> WindowArgs {
        WindowArgs {
            window: window.to_string(),
            start: start.map(str::to_string),
            end: end.map(str::to_string),
        }
    }

    #[test]
    fn validate_window_accepts_known_values() {
        assert_eq!(validate_window("1d").expect("1d"), WindowPreset::OneDay);
        assert_eq!(validate_window("month").expect("month"), WindowPreset::Month);
    }

    #[test]
    fn validate_window_rejects_unknown_values() {
        let err = validate_window("2d").expect_err("expected validation error");
        assert!(err.to_string().contains("Unsupported window"));
    }

    #[test]
    fn validate_format_is_case_insensitive() {
        assert_eq!(validate_format("CSV").expect("csv"), OutputFormat::Csv);
        assert!(validate_format("xml").is_err());
    }

    #[test]
    fn parse_now_defaults_to_wall_clock() {
        let before = now_millis();
        let now = parse_now(None).expect("now");
        assert!(now >= before && now - before < 60_000);
        assert_eq!(parse_now(Some("72000000")).expect("override"), 72_000_000);
        assert!(parse_now(Some("soon")).is_err());
    }

    #[test]
    fn bare_end_date_includes_whole_day() {
        let end = parse_bound("2024-03-31", true).expect("end");
        let start = parse_bound("2024-03-01", false).expect("start");
        assert_eq!(end - start, 31 * 24 * 3_600_000);
    }

    #[test]
    fn explicit_bounds_take_precedence_over_preset() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let args = window_args("7d", Some("0"), Some("36000000"));
        assert_eq!(
            resolve_window(&args, now).expect("window"),
            TimeWindow::new(0, 36_000_000)
        );
    }

    #[test]
    fn invalid_bounds_are_rejected() {
        let now = Utc::now();
        let args = window_args("month", Some("yesterday"), Some("2024-01-01"));
        let err = resolve_window(&args, now).expect_err("bad start");
        assert!(err.to_string().contains("Invalid timestamp 'yesterday'"));
    }

    #[test]
    fn report_query_requires_a_source() {
        let source = SourceArgs {
            input: None,
            project: None,
            kind: "instance".into(),
        };
        assert!(report_query(&source).is_err());

        let source = SourceArgs {
            input: None,
            project: Some("p1".into()),
            kind: "volume".into(),
        };
        assert_eq!(report_query(&source).expect("query"), "volume?project_id=p1");
    }

    #[test]
    fn csv_field_escapes_special_characters() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("a\"b"), "\"a\"\"b\"");
        assert_eq!(csv_field("a\nb"), "\"a\nb\"");
    }
}
