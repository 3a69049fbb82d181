use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::config::{Pacing, RunOptions, Stage, validate_stages};
use crate::error::{Error, Result};

/// YAML run plan: the stage list plus optional overrides of [`RunOptions`].
///
/// ```yaml
/// stages:
///   - { duration: 5m, target: 200 }
///   - { duration: 15m, target: 200 }
///   - { duration: 5m, target: 0 }
/// pacing: 1s
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RunPlan {
    #[serde(default)]
    pub stages: Vec<StagePlan>,

    /// Default delay between iterations of one VU.
    #[serde(default)]
    pub pacing: Option<PlanDuration>,

    #[serde(default)]
    pub pacing_mode: PacingMode,

    #[serde(default)]
    pub reconcile_interval: Option<PlanDuration>,

    #[serde(default)]
    pub iteration_timeout: Option<PlanDuration>,

    #[serde(default)]
    pub graceful_stop: Option<PlanDuration>,

    #[serde(default)]
    pub cancel_grace: Option<PlanDuration>,

    #[serde(default)]
    pub progress_interval: Option<PlanDuration>,

    #[serde(rename = "maxVUs", default)]
    pub max_vus: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagePlan {
    /// Signed so a negative target is reported as such rather than as a type error.
    pub target: i64,

    #[serde(default)]
    pub duration: PlanDuration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PacingMode {
    /// Sleep `pacing` after every iteration.
    #[default]
    After,
    /// Start iterations at most once per `pacing`.
    Interval,
}

impl RunPlan {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = tokio::fs::read(path.as_ref()).await?;
        Ok(serde_yaml::from_slice(&bytes)?)
    }

    /// Validates the plan and converts it into the engine's stage list and options.
    pub fn into_parts(self) -> Result<(Vec<Stage>, RunOptions)> {
        let stages = self
            .stages
            .iter()
            .enumerate()
            .map(|(index, s)| {
                let target = u64::try_from(s.target).map_err(|_| Error::NegativeTarget {
                    index,
                    target: s.target,
                })?;
                Ok(Stage::new(s.duration.into_inner(), target))
            })
            .collect::<Result<Vec<_>>>()?;
        validate_stages(&stages)?;

        let defaults = RunOptions::default();
        let options = RunOptions {
            reconcile_interval: or_default(self.reconcile_interval, defaults.reconcile_interval),
            pacing: self.pacing.map(|d| match self.pacing_mode {
                PacingMode::After => Pacing::After(d.into_inner()),
                PacingMode::Interval => Pacing::Interval(d.into_inner()),
            }),
            iteration_timeout: self.iteration_timeout.map(PlanDuration::into_inner),
            max_vus: self.max_vus,
            graceful_stop: or_default(self.graceful_stop, defaults.graceful_stop),
            cancel_grace: or_default(self.cancel_grace, defaults.cancel_grace),
            progress_interval: or_default(self.progress_interval, defaults.progress_interval),
        };
        options.validate()?;

        Ok((stages, options))
    }
}

fn or_default(value: Option<PlanDuration>, default: Duration) -> Duration {
    value.map(PlanDuration::into_inner).unwrap_or(default)
}

/// Plan duration: a humantime string (`90s`, `5m`, `1h 30m`) or a number of seconds.
///
/// Zero is allowed, so a stage can jump straight to its target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanDuration(Duration);

impl PlanDuration {
    pub fn into_inner(self) -> Duration {
        self.0
    }

    fn from_secs_f64<E: serde::de::Error>(secs: f64) -> std::result::Result<Self, E> {
        if secs.is_nan() || secs < 0.0 {
            return Err(E::custom(format!(
                "stage duration {secs} is not a non-negative number of seconds"
            )));
        }
        Duration::try_from_secs_f64(secs).map(Self).map_err(E::custom)
    }
}

impl From<Duration> for PlanDuration {
    fn from(value: Duration) -> Self {
        Self(value)
    }
}

struct PlanDurationVisitor;

impl serde::de::Visitor<'_> for PlanDurationVisitor {
    type Value = PlanDuration;

    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("a duration like `30s` or `5m`, or a number of seconds")
    }

    fn visit_u64<E: serde::de::Error>(self, secs: u64) -> std::result::Result<PlanDuration, E> {
        Ok(PlanDuration(Duration::from_secs(secs)))
    }

    fn visit_i64<E: serde::de::Error>(self, secs: i64) -> std::result::Result<PlanDuration, E> {
        match u64::try_from(secs) {
            Ok(secs) => self.visit_u64(secs),
            Err(_) => Err(E::custom(format!("stage duration {secs}s is negative"))),
        }
    }

    fn visit_f64<E: serde::de::Error>(self, secs: f64) -> std::result::Result<PlanDuration, E> {
        PlanDuration::from_secs_f64(secs)
    }

    fn visit_str<E: serde::de::Error>(self, raw: &str) -> std::result::Result<PlanDuration, E> {
        humantime::parse_duration(raw.trim())
            .map(PlanDuration)
            .map_err(|err| E::custom(format!("invalid duration `{raw}`: {err}")))
    }
}

impl<'de> Deserialize<'de> for PlanDuration {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(PlanDurationVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(raw: &str) -> Result<(Vec<Stage>, RunOptions)> {
        RunPlan::from_yaml_str(raw)?.into_parts()
    }

    #[test]
    fn parses_humantime_and_numeric_durations() {
        let (stages, options) = parts(
            r#"
stages:
  - { duration: 5m, target: 200 }
  - { duration: 900, target: 200 }
  - { duration: 0.5, target: 0 }
pacing: 1s
"#,
        )
        .unwrap_or_else(|e| panic!("plan should parse: {e}"));

        assert_eq!(
            stages,
            vec![
                Stage::new(Duration::from_secs(300), 200),
                Stage::new(Duration::from_secs(900), 200),
                Stage::new(Duration::from_millis(500), 0),
            ]
        );
        assert_eq!(options.pacing, Some(Pacing::After(Duration::from_secs(1))));
        assert_eq!(options.graceful_stop, RunOptions::default().graceful_stop);
    }

    #[test]
    fn options_override_defaults() {
        let (_, options) = parts(
            r#"
stages: [{ duration: 10s, target: 5 }]
pacing: 250ms
pacingMode: interval
reconcileInterval: 500ms
iterationTimeout: 2s
gracefulStop: 10s
cancelGrace: 1s
progressInterval: 2s
maxVUs: 50
"#,
        )
        .unwrap_or_else(|e| panic!("plan should parse: {e}"));

        assert_eq!(
            options.pacing,
            Some(Pacing::Interval(Duration::from_millis(250)))
        );
        assert_eq!(options.reconcile_interval, Duration::from_millis(500));
        assert_eq!(options.iteration_timeout, Some(Duration::from_secs(2)));
        assert_eq!(options.graceful_stop, Duration::from_secs(10));
        assert_eq!(options.cancel_grace, Duration::from_secs(1));
        assert_eq!(options.progress_interval, Duration::from_secs(2));
        assert_eq!(options.max_vus, Some(50));
    }

    #[test]
    fn plan_built_in_code_converts() {
        let plan = RunPlan {
            stages: vec![
                StagePlan {
                    target: 20,
                    duration: Duration::from_secs(30).into(),
                },
                StagePlan {
                    target: 0,
                    duration: Duration::from_secs(10).into(),
                },
            ],
            pacing: Some(Duration::from_millis(500).into()),
            pacing_mode: PacingMode::Interval,
            ..RunPlan::default()
        };

        let (stages, options) = plan
            .into_parts()
            .unwrap_or_else(|e| panic!("plan should convert: {e}"));
        assert_eq!(stages[0], Stage::new(Duration::from_secs(30), 20));
        assert_eq!(
            options.pacing,
            Some(Pacing::Interval(Duration::from_millis(500)))
        );
        assert_eq!(options.max_vus, None);
    }

    fn plan_error(raw: &str) -> String {
        match parts(raw) {
            Err(err) => err.to_string(),
            Ok(_) => panic!("plan should be rejected: {raw}"),
        }
    }

    #[test]
    fn duration_errors_name_the_bad_value() {
        let negative = plan_error("stages: [{ duration: -5, target: 1 }]");
        assert!(negative.contains("-5s is negative"), "{negative}");

        let garbage = plan_error("stages: [{ duration: soon, target: 1 }]");
        assert!(garbage.contains("invalid duration `soon`"), "{garbage}");
    }

    #[test]
    fn zero_duration_stage_is_accepted() {
        let (stages, _) = parts("stages: [{ duration: 0s, target: 0 }]")
            .unwrap_or_else(|e| panic!("plan should parse: {e}"));
        assert_eq!(stages, vec![Stage::new(Duration::ZERO, 0)]);
    }

    #[test]
    fn rejects_invalid_plans() {
        assert!(matches!(parts("stages: []"), Err(Error::InvalidStages)));
        assert!(matches!(parts("pacing: 1s"), Err(Error::InvalidStages)));

        assert!(matches!(
            parts("stages: [{ duration: 1s, target: 3 }, { duration: 1s, target: -1 }]"),
            Err(Error::NegativeTarget {
                index: 1,
                target: -1
            })
        ));

        assert!(matches!(
            parts("stages: [{ duration: -5, target: 1 }]"),
            Err(Error::Plan(_))
        ));
        assert!(matches!(
            parts("stages: [{ duration: .nan, target: 1 }]"),
            Err(Error::Plan(_))
        ));
        assert!(matches!(
            parts("stages: [{ duration: soon, target: 1 }]"),
            Err(Error::Plan(_))
        ));
        assert!(matches!(
            parts("stages: [{ duration: 1s, target: 1 }]\nmaxVUs: 0"),
            Err(Error::InvalidMaxVus)
        ));
        assert!(matches!(
            parts("stages: [{ duration: 1s, target: 1 }]\nreconcileInterval: 0s"),
            Err(Error::InvalidReconcileInterval)
        ));
        assert!(matches!(
            parts("stages: [{ duration: 1s, target: 1 }]\nrampUp: 1s"),
            Err(Error::Plan(_))
        ));
    }
}
