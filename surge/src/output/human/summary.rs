use std::fmt::Write as _;

use surge_core::{MetricValue, Summary};

use super::format::{format_duration, format_ms_opt, format_percent_opt, format_rate};

/// Width the metric names are padded to with dots, k6 style.
const NAME_WIDTH: usize = 24;

pub(crate) fn render(summary: &Summary) -> String {
    let mut out = String::new();

    writeln!(
        &mut out,
        "summary: state={} duration={}",
        summary.state,
        format_duration(summary.duration)
    )
    .ok();
    if let Some(reason) = &summary.abort_reason {
        writeln!(&mut out, "aborted: {reason}").ok();
    }
    out.push('\n');

    render_checks(summary, &mut out);
    render_metrics(summary, &mut out);
    render_thresholds(summary, &mut out);

    writeln!(
        &mut out,
        "result: {}",
        if summary.overall_pass { "pass" } else { "FAIL" }
    )
    .ok();

    out
}

fn render_checks(summary: &Summary, out: &mut String) {
    if summary.checks.is_empty() {
        return;
    }

    out.push_str("checks\n");
    for c in &summary.checks {
        let total = c.passes.saturating_add(c.fails);
        let mark = if c.fails == 0 { "ok  " } else { "FAIL" };
        let pct = if total > 0 {
            c.passes as f64 * 100.0 / total as f64
        } else {
            0.0
        };
        writeln!(
            out,
            "  {mark} {} ({pct:.2}% pass {} / fail {})",
            c.name, c.passes, c.fails
        )
        .ok();
    }
    out.push('\n');
}

fn render_metrics(summary: &Summary, out: &mut String) {
    let secs = summary.duration.as_secs_f64().max(1e-9);

    out.push_str("metrics\n");
    for (name, metric) in &summary.metrics {
        let value = match &metric.value {
            MetricValue::Counter(v) => {
                format!("{v} {}/s", format_rate(*v as f64 / secs))
            }
            MetricValue::Gauge(v) => v.to_string(),
            MetricValue::Rate(r) => format!(
                "{} {} of {}",
                format_percent_opt(r.rate),
                r.hits,
                r.total
            ),
            MetricValue::Trend(t) if t.count == 0 => "n/a".to_string(),
            MetricValue::Trend(t) => format!(
                "avg={} min={} med={} max={} p(90)={} p(95)={} p(99)={}",
                format_ms_opt(t.avg),
                format_ms_opt(t.min),
                format_ms_opt(t.med),
                format_ms_opt(t.max),
                format_ms_opt(t.p90),
                format_ms_opt(t.p95),
                format_ms_opt(t.p99),
            ),
        };

        writeln!(out, "  {}: {value}", dotted(name)).ok();
    }
    out.push('\n');
}

fn render_thresholds(summary: &Summary, out: &mut String) {
    if summary.thresholds.is_empty() {
        return;
    }

    out.push_str("thresholds\n");
    for t in &summary.thresholds {
        let mark = if t.passed { "ok  " } else { "FAIL" };
        let detail = match (t.observed, &t.diagnostic) {
            (Some(v), _) => format!("observed {v:.4}"),
            (None, Some(d)) => d.clone(),
            (None, None) => "no value".to_string(),
        };
        writeln!(out, "  {mark} {} ({detail})", t.name()).ok();
    }
    out.push('\n');
}

fn dotted(name: &str) -> String {
    let dots = NAME_WIDTH.saturating_sub(name.len()).max(2);
    format!("{name}{}", ".".repeat(dots))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::tests::sample_summary;

    #[test]
    fn renders_sections_k6_style() {
        let text = render(&sample_summary());

        assert!(text.starts_with("summary: state=aborted duration=4s\n"), "{text}");
        assert!(text.contains("aborted: threshold `http_req_failed: rate<0.01` crossed"), "{text}");
        assert!(
            text.contains("  FAIL status is 200 (95.00% pass 38 / fail 2)"),
            "{text}"
        );
        assert!(text.contains("  http_reqs...............: 40 10.0/s"), "{text}");
        assert!(text.contains("http_req_failed"), "{text}");
        assert!(text.contains(": 5.00% 2 of 40"), "{text}");
        assert!(text.contains("p(90)=8.00ms"), "{text}");
        assert!(
            text.contains("  FAIL http_req_failed: rate<0.01 (observed 0.0500)"),
            "{text}"
        );
        assert!(text.ends_with("result: FAIL\n"), "{text}");
    }

    #[test]
    fn long_names_keep_two_dots() {
        assert_eq!(dotted("a_very_long_metric_name_indeed"), "a_very_long_metric_name_indeed..");
        assert_eq!(dotted("vus").len(), NAME_WIDTH + 3);
    }
}
