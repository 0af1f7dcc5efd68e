use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr as _;
use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;
use surge_core::{RampShape, RunPlan, Stage, Threshold};

/// Default per-request timeout, matching k6's `http.get` default.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct PlanYaml {
    #[serde(default)]
    target: TargetYaml,

    #[serde(rename = "startVUs", default)]
    start_vus: Option<u64>,

    #[serde(default)]
    stages: Vec<StageYaml>,

    /// linear | step
    #[serde(default)]
    ramp: Option<String>,

    #[serde(default)]
    tick: Option<YamlDuration>,

    #[serde(default)]
    think_time: Option<YamlDuration>,

    #[serde(default)]
    graceful_stop: Option<YamlDuration>,

    #[serde(default)]
    graceful_ramp_down: Option<YamlDuration>,

    #[serde(default)]
    threshold_interval: Option<YamlDuration>,

    #[serde(default)]
    max_scheduler_error_rate: Option<f64>,

    #[serde(default)]
    thresholds: BTreeMap<String, ThresholdsYaml>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct StageYaml {
    target: u64,

    #[serde(default)]
    duration: YamlDuration,
}

/// The request every iteration sends. All fields are optional in the file so that
/// `--url` can supply the target.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct TargetYaml {
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub method: Option<String>,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub body: Option<String>,

    /// Status the `status is <N>` check expects.
    #[serde(default)]
    pub expect_status: Option<u16>,

    #[serde(default)]
    pub timeout: Option<YamlDuration>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ThresholdsYaml {
    One(ThresholdYaml),
    Many(Vec<ThresholdYaml>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ThresholdYaml {
    Expr(String),
    Full(ThresholdObjectYaml),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ThresholdObjectYaml {
    threshold: String,

    #[serde(default)]
    abort_on_fail: bool,

    #[serde(default)]
    delay_abort_eval: Option<YamlDuration>,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct YamlDuration(Duration);

impl YamlDuration {
    fn into_inner(self) -> Duration {
        self.0
    }
}

impl<'de> Deserialize<'de> for YamlDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl<'de> serde::de::Visitor<'de> for V {
            type Value = YamlDuration;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("duration as string (e.g. 10s), integer seconds, or float seconds")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(YamlDuration(Duration::from_secs(v)))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                u64::try_from(v)
                    .map(|v| YamlDuration(Duration::from_secs(v)))
                    .map_err(|_| E::custom("duration must not be negative"))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if !v.is_finite() || v < 0.0 {
                    return Err(E::custom("duration must be a non-negative, finite number"));
                }
                Ok(YamlDuration(Duration::from_secs_f64(v)))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                let d = humantime::parse_duration(v.trim()).map_err(E::custom)?;
                Ok(YamlDuration(d))
            }

            fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                self.visit_str(&v)
            }
        }

        deserializer.deserialize_any(V)
    }
}

/// A plan file split into the engine-facing plan and the request description.
#[derive(Debug, Clone)]
pub(crate) struct PlanFile {
    pub plan: RunPlan,
    pub target: TargetYaml,
}

/// The resolved request of the built-in HTTP test body.
#[derive(Debug, Clone)]
pub(crate) struct Target {
    pub method: http::Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub expect_status: u16,
    pub timeout: Duration,
}

impl TargetYaml {
    pub(crate) fn resolve(self) -> anyhow::Result<Target> {
        let url = self
            .url
            .filter(|u| !u.trim().is_empty())
            .context("missing `target.url` (set it in the plan or pass --url)")?;

        let parsed = url::Url::parse(&url).with_context(|| format!("invalid target url: {url}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            anyhow::bail!(
                "unsupported target url scheme `{}` (expected http or https): {url}",
                parsed.scheme()
            );
        }

        let method = match self.method {
            Some(m) => http::Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes())
                .with_context(|| format!("invalid `target.method`: {m}"))?,
            None => http::Method::GET,
        };

        let expect_status = self.expect_status.unwrap_or(200);
        if !(100..=999).contains(&expect_status) {
            anyhow::bail!("invalid `target.expectStatus`: {expect_status}");
        }

        Ok(Target {
            method,
            url,
            headers: self.headers.into_iter().collect(),
            body: self.body,
            expect_status,
            timeout: self
                .timeout
                .map(YamlDuration::into_inner)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        })
    }
}

pub fn looks_like_yaml_path(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()).map(|s| s.to_ascii_lowercase()),
        Some(ext) if ext == "yml" || ext == "yaml"
    )
}

pub async fn load_plan(path: &Path) -> anyhow::Result<PlanFile> {
    if !looks_like_yaml_path(path) {
        anyhow::bail!(
            "unsupported plan extension (expected .yaml or .yml): {}",
            path.display()
        );
    }

    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read plan: {}", path.display()))?;

    parse_plan(&text).with_context(|| format!("invalid plan: {}", path.display()))
}

pub(crate) fn parse_plan(text: &str) -> anyhow::Result<PlanFile> {
    let doc: PlanYaml = serde_yaml::from_str(text).context("failed to parse YAML")?;
    plan_yaml_into_plan(doc)
}

fn plan_yaml_into_plan(doc: PlanYaml) -> anyhow::Result<PlanFile> {
    let PlanYaml {
        target,
        start_vus,
        stages,
        ramp,
        tick,
        think_time,
        graceful_stop,
        graceful_ramp_down,
        threshold_interval,
        max_scheduler_error_rate,
        thresholds,
    } = doc;

    let mut plan = RunPlan::new(
        stages
            .into_iter()
            .map(|s| Stage::new(s.duration.into_inner(), s.target))
            .collect(),
    );
    if let Some(start_vus) = start_vus {
        plan.start_vus = start_vus;
    }

    if let Some(raw) = ramp {
        plan.ramp = RampShape::from_str(raw.trim())
            .map_err(|_| anyhow::anyhow!("invalid `ramp` `{raw}` (expected linear or step)"))?;
    }
    if let Some(d) = tick {
        plan.tick = d.into_inner();
    }
    plan.think_time = think_time.map(YamlDuration::into_inner).filter(|d| !d.is_zero());
    if let Some(d) = graceful_stop {
        plan.graceful_stop = d.into_inner();
    }
    if let Some(d) = graceful_ramp_down {
        plan.graceful_ramp_down = d.into_inner();
    }
    if let Some(d) = threshold_interval {
        plan.threshold_interval = d.into_inner();
    }
    if let Some(rate) = max_scheduler_error_rate {
        plan.max_scheduler_error_rate = rate;
    }

    plan.thresholds = parse_thresholds_map(thresholds)?;

    Ok(PlanFile { plan, target })
}

fn parse_thresholds_map(raw: BTreeMap<String, ThresholdsYaml>) -> anyhow::Result<Vec<Threshold>> {
    let mut out = Vec::new();

    for (metric, entries) in raw {
        let entries = match entries {
            ThresholdsYaml::One(e) => vec![e],
            ThresholdsYaml::Many(v) => v,
        };

        for entry in entries {
            let threshold = match entry {
                ThresholdYaml::Expr(expr) => Threshold::new(metric.as_str(), expr)?,
                ThresholdYaml::Full(obj) => {
                    let t = Threshold::new(metric.as_str(), obj.threshold)?;
                    if obj.abort_on_fail {
                        t.abort_on_fail(
                            obj.delay_abort_eval
                                .map(YamlDuration::into_inner)
                                .unwrap_or_default(),
                        )
                    } else {
                        t
                    }
                }
            };
            out.push(threshold);
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> PlanFile {
        parse_plan(text).unwrap_or_else(|e| panic!("failed to parse plan: {e:#}"))
    }

    const K6_PLAN: &str = r#"
target:
  url: https://example.com/
stages:
  - { duration: 10s, target: 10 }
  - { duration: 20s, target: 20 }
  - { duration: 20s, target: 50 }
  - { duration: 20s, target: 80 }
  - { duration: 20s, target: 100 }
  - { duration: 20s, target: 0 }
thinkTime: 1s
thresholds:
  http_req_failed: ['rate<0.01']
  http_req_duration: ['p(90)<3000']
"#;

    #[test]
    fn loads_k6_shaped_plan() {
        let file = parse(K6_PLAN);
        let plan = &file.plan;

        assert_eq!(plan.stages.len(), 6);
        assert_eq!(plan.stages[0], Stage::new(Duration::from_secs(10), 10));
        assert_eq!(plan.total_duration(), Duration::from_secs(110));
        assert_eq!(plan.max_target(), 100);
        assert_eq!(plan.think_time, Some(Duration::from_secs(1)));
        assert_eq!(plan.ramp, RampShape::Linear);
        assert_eq!(plan.start_vus, 1);
        assert!(plan.validate().is_ok());

        let names: Vec<String> = plan.thresholds.iter().map(Threshold::name).collect();
        assert_eq!(
            names,
            vec![
                "http_req_duration: p(90)<3000".to_string(),
                "http_req_failed: rate<0.01".to_string(),
            ]
        );
        assert!(plan.thresholds.iter().all(|t| !t.abort_on_fail));
    }

    #[test]
    fn threshold_objects_carry_abort_settings() {
        let file = parse(
            r#"
stages: [{ duration: 1m30s, target: 5 }]
thresholds:
  checks:
    - 'rate<0.1'
    - threshold: 'rate<0.5'
      abortOnFail: true
      delayAbortEval: 10s
  iterations: 'count>0'
"#,
        );

        let t = &file.plan.thresholds;
        assert_eq!(t.len(), 3);
        assert!(!t[0].abort_on_fail);
        assert!(t[1].abort_on_fail);
        assert_eq!(t[1].delay_abort_eval, Duration::from_secs(10));
        assert_eq!(t[2].metric, "iterations");
        assert_eq!(file.plan.stages[0].duration, Duration::from_secs(90));
    }

    #[test]
    fn optional_knobs_override_defaults() {
        let file = parse(
            r#"
startVUs: 3
ramp: Step
tick: 250ms
gracefulStop: 5
gracefulRampDown: 1.5
thresholdInterval: 500ms
maxSchedulerErrorRate: 0.25
stages: [{ duration: 2s, target: 4 }]
"#,
        );
        let plan = &file.plan;

        assert_eq!(plan.start_vus, 3);
        assert_eq!(plan.ramp, RampShape::Step);
        assert_eq!(plan.tick, Duration::from_millis(250));
        assert_eq!(plan.graceful_stop, Duration::from_secs(5));
        assert_eq!(plan.graceful_ramp_down, Duration::from_millis(1500));
        assert_eq!(plan.threshold_interval, Duration::from_millis(500));
        assert_eq!(plan.max_scheduler_error_rate, 0.25);
        assert_eq!(plan.think_time, None);
    }

    #[test]
    fn rejects_bad_input() {
        let err = |text: &str| match parse_plan(text) {
            Ok(_) => panic!("expected an error for:\n{text}"),
            Err(e) => format!("{e:#}"),
        };

        let msg =
            err("stages: [{ duration: 1s, target: 1 }]\nthresholds:\n  checks: ['rate<<1']\n");
        assert!(msg.contains("checks"), "{msg}");

        let msg = err("stages: [{ duration: 1s, target: 1 }]\nramp: cubic\n");
        assert!(msg.contains("cubic"), "{msg}");

        let msg = err("stages: [{ duration: 1s, target: 1 }]\nvus: 10\n");
        assert!(msg.contains("vus"), "{msg}");

        err("stages: [{ duration: soon, target: 1 }]\n");
    }

    #[test]
    fn target_resolves_with_defaults() {
        let target = parse(K6_PLAN)
            .target
            .resolve()
            .unwrap_or_else(|e| panic!("{e:#}"));

        assert_eq!(target.method, http::Method::GET);
        assert_eq!(target.url, "https://example.com/");
        assert_eq!(target.expect_status, 200);
        assert_eq!(target.timeout, DEFAULT_REQUEST_TIMEOUT);
        assert!(target.headers.is_empty());
    }

    #[test]
    fn target_requires_http_url() {
        assert!(TargetYaml::default().resolve().is_err());

        let target = TargetYaml {
            url: Some("ftp://example.com/".to_string()),
            ..TargetYaml::default()
        };
        assert!(target.resolve().is_err());

        let target = TargetYaml {
            url: Some("http://localhost:8080/api".to_string()),
            method: Some("post".to_string()),
            expect_status: Some(201),
            ..TargetYaml::default()
        };
        let target = target.resolve().unwrap_or_else(|e| panic!("{e:#}"));
        assert_eq!(target.method, http::Method::POST);
        assert_eq!(target.expect_status, 201);
    }

    #[test]
    fn yaml_path_detection() {
        assert!(looks_like_yaml_path(Path::new("plan.yaml")));
        assert!(looks_like_yaml_path(Path::new("dir/plan.YML")));
        assert!(!looks_like_yaml_path(Path::new("plan.json")));
        assert!(!looks_like_yaml_path(Path::new("plan")));
    }
}
