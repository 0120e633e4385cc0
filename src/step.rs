//! Built-in steps and the tag registry used to construct them from string parameters.
use std::{collections::BTreeMap, time::Duration};

use crate::{
    error::EngineError,
    session::{Session, Value},
};

const NOT_SET: &str = "<not set>";

/// One unit of scenario work.
#[derive(Clone, Debug, PartialEq)]
pub enum Step {
    /// Logs `message`, replacing each `{}` with the next variable of `vars`.
    Log { message: String, vars: Vec<String> },
    Set { var: String, value: Value },
    Pause(Duration),
}

impl Step {
    pub async fn run(&self, session: &Session) -> Result<(), EngineError> {
        match self {
            Step::Log { message, vars } => {
                let values: Vec<String> = vars
                    .iter()
                    .map(|name| {
                        session
                            .var(name)
                            .map_or_else(|| NOT_SET.to_string(), |v| v.to_string())
                    })
                    .collect();
                tracing::info!("{}", format_message(message, &values));
            }
            Step::Set { var, value } => session.set_var(var, value.clone()),
            Step::Pause(duration) => tokio::time::sleep(*duration).await,
        }
        Ok(())
    }
}

/// Fills `{}` placeholders in order. Extra placeholders are left as they are.
fn format_message(message: &str, values: &[String]) -> String {
    let mut out = String::with_capacity(message.len());
    let mut values = values.iter();
    let mut rest = message;
    while let Some(at) = rest.find("{}") {
        out.push_str(&rest[..at]);
        match values.next() {
            Some(value) => out.push_str(value),
            None => out.push_str("{}"),
        }
        rest = &rest[at + 2..];
    }
    out.push_str(rest);
    out
}

/// Builds a step from its string parameters.
pub type StepConstructor = fn(&BTreeMap<String, String>) -> Result<Step, EngineError>;

/// Maps step tags to constructors. `default()` knows `log`, `set` and `pause`.
#[derive(Clone, Debug)]
pub struct StepRegistry {
    constructors: BTreeMap<String, StepConstructor>,
}

impl Default for StepRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("log", build_log);
        registry.register("set", build_set);
        registry.register("pause", build_pause);
        registry
    }
}

impl StepRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registers `constructor` under `tag`, replacing any previous one.
    pub fn register(&mut self, tag: impl Into<String>, constructor: StepConstructor) {
        self.constructors.insert(tag.into(), constructor);
    }

    pub fn build(&self, tag: &str, params: &BTreeMap<String, String>) -> Result<Step, EngineError> {
        let constructor = self
            .constructors
            .get(tag)
            .ok_or_else(|| EngineError::Step(format!("unknown step '{tag}'")))?;
        constructor(params)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}

fn required<'a>(
    step: &str,
    params: &'a BTreeMap<String, String>,
    name: &str,
) -> Result<&'a str, EngineError> {
    params
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| EngineError::Step(format!("{step}: missing {name}")))
}

fn build_log(params: &BTreeMap<String, String>) -> Result<Step, EngineError> {
    let message = required("log", params, "message")?.to_string();
    let vars = params
        .get("vars")
        .map(|vars| {
            vars.split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok(Step::Log { message, vars })
}

fn build_set(params: &BTreeMap<String, String>) -> Result<Step, EngineError> {
    let var = required("set", params, "var")?.to_string();
    let raw = required("set", params, "value")?;
    let value = raw
        .parse::<i64>()
        .map_or_else(|_| Value::from(raw), Value::Int);
    Ok(Step::Set { var, value })
}

fn build_pause(params: &BTreeMap<String, String>) -> Result<Step, EngineError> {
    let raw = required("pause", params, "duration")?;
    parse_duration(raw)
        .map(Step::Pause)
        .ok_or_else(|| EngineError::Step(format!("pause: invalid duration '{raw}'")))
}

/// `250ms`, `2s`, `1m`, or a bare number of milliseconds.
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (number, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(at) => raw.split_at(at),
        None => (raw, "ms"),
    };
    let n: u64 = number.parse().ok()?;
    match unit.trim() {
        "ms" => Some(Duration::from_millis(n)),
        "s" => Some(Duration::from_secs(n)),
        "m" => Some(Duration::from_secs(n.checked_mul(60)?)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{executor::EventLoopGroup, session::test_support};

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn placeholders_are_filled_in_order() {
        let values = ["alice".to_string(), NOT_SET.to_string()];
        assert_eq!(
            format_message("user {} has {} items", &values),
            "user alice has <not set> items"
        );
        assert_eq!(format_message("{} and {}", &values[..1]), "alice and {}");
        assert_eq!(format_message("no vars", &[]), "no vars");
    }

    #[test]
    fn registry_builds_known_tags() {
        let registry = StepRegistry::default();
        assert_eq!(registry.tags().collect::<Vec<_>>(), ["log", "pause", "set"]);
        assert_eq!(
            registry
                .build("log", &params(&[("message", "hi {}"), ("vars", "a, b")]))
                .unwrap(),
            Step::Log {
                message: "hi {}".into(),
                vars: vec!["a".into(), "b".into()],
            }
        );
        assert_eq!(
            registry
                .build("set", &params(&[("var", "n"), ("value", "42")]))
                .unwrap(),
            Step::Set {
                var: "n".into(),
                value: Value::Int(42),
            }
        );
        assert_eq!(
            registry
                .build("pause", &params(&[("duration", "2s")]))
                .unwrap(),
            Step::Pause(Duration::from_secs(2))
        );
    }

    #[test]
    fn unknown_tags_and_missing_params_are_step_errors() {
        let registry = StepRegistry::default();
        let err = registry.build("httpRequest", &params(&[])).unwrap_err();
        assert_eq!(err.to_string(), "step error: unknown step 'httpRequest'");
        let err = registry.build("log", &params(&[])).unwrap_err();
        assert_eq!(err.to_string(), "step error: log: missing message");
        assert!(matches!(
            registry.build("pause", &params(&[("duration", "soon")])),
            Err(EngineError::Step(_))
        ));
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("250"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("1m"), Some(Duration::from_secs(60)));
        assert_eq!(parse_duration("5h"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[tokio::test]
    async fn log_step_reads_session_variables() {
        let group = EventLoopGroup::new(1).unwrap();
        let session = test_support::session(0, group.executor(0).clone());
        session.set_var("user", "bob");
        let step = Step::Log {
            message: "{} / {}".into(),
            vars: vec!["user".into(), "missing".into()],
        };
        step.run(&session).await.unwrap();
        let set = Step::Set {
            var: "user".into(),
            value: Value::Int(7),
        };
        set.run(&session).await.unwrap();
        assert_eq!(session.var("user"), Some(Value::Int(7)));
    }
}
