//! Action executor boundary and the built-in mock executor.
//!
//! The coordinator never runs actions itself: it hands `(action, input,
//! deadline)` to an [`ActionExecutor`] on a worker and classifies the
//! outcome. Real backends (LLM, HTTP, MCP, …) live in other services; the
//! mock executor ships here because tests, the CLI, and the determinism
//! guarantees depend on it.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use tracing::debug;

use crate::definition::{ActionDef, ActionKind};

/// Result of one action invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Ok(Value),
    /// Retryable: the step retry policy applies.
    Transient(String),
    /// Not retryable: subject to the step's `onFailure`.
    Fatal(String),
}

/// Single-method capability supplied by dependency injection.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn run(&self, action: &ActionDef, input: Value, deadline: Duration) -> ActionOutcome;
}

/// One recorded mock invocation, for test assertions.
#[derive(Debug, Clone)]
pub struct InvocationRecord {
    pub action_ref: String,
    pub input: Value,
    /// Milliseconds since executor creation.
    pub at_ms: u64,
}

/// Deterministic mock executor for `kind: mock` actions.
///
/// The action's `implementation` block drives behavior:
///
/// - `output`: literal value returned as-is
/// - `echo: true`: returns the action input
/// - `outputSchema`: a schema-conforming value is sampled with a seeded RNG
/// - `delayMs`: number or `[lo, hi]` sleep before responding
/// - `transientFailures`: fail transiently for the first N invocations of
///   this `(action, input)` site
/// - `fatal`: always fail fatally with the given message
///
/// Sampling is a pure function of `(seed, action, input)`, so a fixed seed
/// and definition reproduce bit-identical outputs regardless of worker
/// scheduling.
pub struct MockActionExecutor {
    seed: u64,
    started: Instant,
    invocations: Mutex<Vec<InvocationRecord>>,
    transient_remaining: DashMap<u64, u32>,
}

impl MockActionExecutor {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            started: Instant::now(),
            invocations: Mutex::new(Vec::new()),
            transient_remaining: DashMap::new(),
        }
    }

    /// All invocations so far, in call order.
    pub fn invocations(&self) -> Vec<InvocationRecord> {
        self.invocations.lock().expect("mock lock").clone()
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().expect("mock lock").len()
    }

    fn site_key(action: &ActionDef, input: &Value) -> u64 {
        let mut hasher = DefaultHasher::new();
        action.reference.hash(&mut hasher);
        action.version.hash(&mut hasher);
        // serde_json maps are sorted, so this rendering is stable.
        input.to_string().hash(&mut hasher);
        hasher.finish()
    }

    fn rng_for(&self, key: u64) -> StdRng {
        StdRng::seed_from_u64(self.seed ^ key)
    }
}

#[async_trait]
impl ActionExecutor for MockActionExecutor {
    async fn run(&self, action: &ActionDef, input: Value, _deadline: Duration) -> ActionOutcome {
        if action.action_kind != ActionKind::Mock {
            return ActionOutcome::Fatal(format!(
                "no backend wired for action kind '{:?}'",
                action.action_kind
            ));
        }

        let implementation = &action.implementation;
        let key = Self::site_key(action, &input);
        let mut rng = self.rng_for(key);

        self.invocations.lock().expect("mock lock").push(InvocationRecord {
            action_ref: action.reference.clone(),
            input: input.clone(),
            at_ms: self.started.elapsed().as_millis() as u64,
        });

        if let Some(delay) = implementation.get("delayMs") {
            let millis = match delay {
                Value::Number(n) => n.as_u64().unwrap_or(0),
                Value::Array(range) if range.len() == 2 => {
                    let lo = range[0].as_u64().unwrap_or(0);
                    let hi = range[1].as_u64().unwrap_or(lo);
                    if hi > lo {
                        rng.gen_range(lo..=hi)
                    } else {
                        lo
                    }
                }
                _ => 0,
            };
            if millis > 0 {
                tokio::time::sleep(Duration::from_millis(millis)).await;
            }
        }

        if let Some(message) = implementation.get("fatal").and_then(|v| v.as_str()) {
            return ActionOutcome::Fatal(message.to_string());
        }

        if let Some(n) = implementation.get("transientFailures").and_then(|v| v.as_u64()) {
            let mut remaining = self
                .transient_remaining
                .entry(key)
                .or_insert(n as u32);
            if *remaining > 0 {
                *remaining -= 1;
                debug!(action = %action.reference, remaining = *remaining, "scripted transient failure");
                return ActionOutcome::Transient("scripted transient failure".to_string());
            }
        }

        if let Some(output) = implementation.get("output") {
            return ActionOutcome::Ok(output.clone());
        }

        if implementation.get("echo").and_then(|v| v.as_bool()).unwrap_or(false) {
            return ActionOutcome::Ok(input);
        }

        if let Some(schema) = implementation.get("outputSchema") {
            return ActionOutcome::Ok(sample(schema, &mut rng));
        }

        ActionOutcome::Ok(Value::Object(serde_json::Map::new()))
    }
}

/// Sample a value conforming to a (small, structural) JSON schema subset:
/// `const`, `enum`, object properties, arrays with `items`, strings with
/// `minLength`/`maxLength`, numerics with `minimum`/`maximum`, booleans.
fn sample(schema: &Value, rng: &mut StdRng) -> Value {
    if let Some(constant) = schema.get("const") {
        return constant.clone();
    }
    if let Some(options) = schema.get("enum").and_then(|v| v.as_array()) {
        if options.is_empty() {
            return Value::Null;
        }
        return options[rng.gen_range(0..options.len())].clone();
    }

    let declared_type = schema
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| if schema.get("properties").is_some() { "object" } else { "null" });

    match declared_type {
        "object" => {
            let mut map = serde_json::Map::new();
            if let Some(props) = schema.get("properties").and_then(|v| v.as_object()) {
                for (name, prop_schema) in props {
                    map.insert(name.clone(), sample(prop_schema, rng));
                }
            }
            Value::Object(map)
        }
        "array" => {
            let min = schema.get("minItems").and_then(|v| v.as_u64()).unwrap_or(1) as usize;
            let max = schema.get("maxItems").and_then(|v| v.as_u64()).unwrap_or(3) as usize;
            let len = if max > min { rng.gen_range(min..=max) } else { min };
            let items_schema = schema.get("items").cloned().unwrap_or(Value::Null);
            (0..len).map(|_| sample(&items_schema, rng)).collect()
        }
        "string" => {
            let min = schema.get("minLength").and_then(|v| v.as_u64()).unwrap_or(8) as usize;
            let max = schema.get("maxLength").and_then(|v| v.as_u64()).unwrap_or(min.max(12) as u64)
                as usize;
            let len = if max > min { rng.gen_range(min..=max) } else { min };
            const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
            let s: String = (0..len)
                .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
                .collect();
            Value::String(s)
        }
        "integer" => {
            let min = schema.get("minimum").and_then(|v| v.as_i64()).unwrap_or(0);
            let max = schema.get("maximum").and_then(|v| v.as_i64()).unwrap_or(min + 100);
            Value::Number(rng.gen_range(min..=max.max(min)).into())
        }
        "number" => {
            let min = schema.get("minimum").and_then(|v| v.as_f64()).unwrap_or(0.0);
            let max = schema.get("maximum").and_then(|v| v.as_f64()).unwrap_or(min + 1.0);
            let n = rng.gen_range(min..=max.max(min));
            serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
        }
        "boolean" => Value::Bool(rng.gen()),
        "null" => Value::Null,
        _ => Value::Null,
    }
}
