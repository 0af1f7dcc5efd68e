use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ThresholdOp {
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    Lte,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    Gte,
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    Ne,
}

impl ThresholdOp {
    pub fn compare(self, left: f64, right: f64) -> bool {
        match self {
            Self::Lt => left < right,
            Self::Lte => left <= right,
            Self::Gt => left > right,
            Self::Gte => left >= right,
            Self::Eq => left == right,
            Self::Ne => left != right,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Statistic {
    Rate,
    Count,
    Value,
    Avg,
    Min,
    Max,
    Med,
    /// Percentile in `(0, 100]`.
    P(f64),
}

impl std::fmt::Display for Statistic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rate => f.write_str("rate"),
            Self::Count => f.write_str("count"),
            Self::Value => f.write_str("value"),
            Self::Avg => f.write_str("avg"),
            Self::Min => f.write_str("min"),
            Self::Max => f.write_str("max"),
            Self::Med => f.write_str("med"),
            Self::P(p) => write!(f, "p({p})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdExpr {
    pub statistic: Statistic,
    /// Metric named inside the expression, e.g. `rate(http_req_failed) < 0.01`.
    pub metric: Option<String>,
    pub op: ThresholdOp,
    pub value: f64,
}

/// Parses `<statistic>[(<args>)] <op> <number>`. Whitespace is ignored.
pub fn parse_threshold_expr(raw: &str) -> std::result::Result<ThresholdExpr, String> {
    let s: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if s.is_empty() {
        return Err("empty threshold".to_string());
    }

    let op_pos = s
        .find(['<', '>', '=', '!'])
        .ok_or_else(|| "missing operator".to_string())?;
    let op_len = if s[op_pos + 1..].starts_with('=') { 2 } else { 1 };
    let op = match &s[op_pos..op_pos + op_len] {
        "<" => ThresholdOp::Lt,
        "<=" => ThresholdOp::Lte,
        ">" => ThresholdOp::Gt,
        ">=" => ThresholdOp::Gte,
        "==" => ThresholdOp::Eq,
        "!=" => ThresholdOp::Ne,
        other => return Err(format!("unknown operator `{other}`")),
    };

    let left = &s[..op_pos];
    let right = &s[op_pos + op_len..];
    if left.is_empty() {
        return Err("missing statistic".to_string());
    }
    if right.is_empty() {
        return Err("missing value".to_string());
    }

    let value: f64 = right
        .parse()
        .ok()
        .filter(|v: &f64| v.is_finite())
        .ok_or_else(|| format!("invalid numeric value `{right}`"))?;

    let (name, args) = match left.split_once('(') {
        Some((name, rest)) => {
            let inner = rest
                .strip_suffix(')')
                .ok_or_else(|| format!("unbalanced parentheses in `{left}`"))?;
            let args: Vec<&str> = inner.split(',').collect();
            if args.iter().any(|a| a.is_empty()) {
                return Err(format!("empty argument in `{left}`"));
            }
            (name, args)
        }
        None => (left, Vec::new()),
    };

    let name = name.to_ascii_lowercase();
    let (statistic, metric) = if name == "p" {
        let (p, metric) = match args.as_slice() {
            [p] => (*p, None),
            [p, metric] => (*p, Some(*metric)),
            _ => return Err("`p` expects `p(N)` or `p(N, metric)`".to_string()),
        };
        let p: f64 = p
            .parse()
            .map_err(|_| format!("invalid percentile `{p}`"))?;
        if !(p > 0.0 && p <= 100.0) {
            return Err(format!("percentile `{p}` out of range (0, 100]"));
        }
        (Statistic::P(p), metric)
    } else {
        let statistic = match name.as_str() {
            "rate" => Statistic::Rate,
            "count" => Statistic::Count,
            "value" => Statistic::Value,
            "avg" => Statistic::Avg,
            "min" => Statistic::Min,
            "max" => Statistic::Max,
            "med" => Statistic::Med,
            _ => return Err(format!("unknown statistic `{name}`")),
        };
        let metric = match args.as_slice() {
            [] => None,
            [metric] => Some(*metric),
            _ => return Err(format!("`{name}` takes at most one metric argument")),
        };
        (statistic, metric)
    };

    Ok(ThresholdExpr {
        statistic,
        metric: metric.map(str::to_string),
        op,
        value,
    })
}

/// A pass/fail rule over one metric.
#[derive(Debug, Clone)]
pub struct Threshold {
    pub metric: String,
    pub expression: String,
    pub parsed: ThresholdExpr,
    pub abort_on_fail: bool,
    /// Breaches before this much run time never abort the run.
    pub delay_abort_eval: Duration,
}

impl Threshold {
    pub fn new(metric: impl Into<String>, expression: impl Into<String>) -> Result<Self> {
        let metric = metric.into();
        let expression = expression.into();
        let invalid = |reason: String| Error::InvalidThreshold {
            metric: metric.clone(),
            expression: expression.clone(),
            reason,
        };

        if metric.trim().is_empty() {
            return Err(invalid("metric name is empty".to_string()));
        }
        let parsed = parse_threshold_expr(&expression).map_err(invalid)?;
        if let Some(inline) = &parsed.metric
            && inline != &metric
        {
            return Err(invalid(format!(
                "expression names metric `{inline}`, expected `{metric}`"
            )));
        }

        Ok(Self {
            metric,
            expression,
            parsed,
            abort_on_fail: false,
            delay_abort_eval: Duration::ZERO,
        })
    }

    /// Builds a threshold from an expression that names its metric inline, such as
    /// `rate(http_req_failed) < 0.01`.
    pub fn parse(expression: impl Into<String>) -> Result<Self> {
        let expression = expression.into();
        let metric = parse_threshold_expr(&expression)
            .map_err(|reason| Error::InvalidThreshold {
                metric: String::new(),
                expression: expression.clone(),
                reason,
            })?
            .metric
            .ok_or_else(|| Error::InvalidThreshold {
                metric: String::new(),
                expression: expression.clone(),
                reason: "expression does not name a metric".to_string(),
            })?;
        Self::new(metric, expression)
    }

    #[must_use]
    pub fn abort_on_fail(mut self, delay: Duration) -> Self {
        self.abort_on_fail = true;
        self.delay_abort_eval = delay;
        self
    }

    /// `metric: expression`, the key used in summaries.
    pub fn name(&self) -> String {
        format!("{}: {}", self.metric, self.expression)
    }
}
