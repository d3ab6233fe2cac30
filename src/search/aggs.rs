use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};
use serde_json::{Map, Value, json};
use crate::core::error::{Error, Result};

/// Running statistics of one field, the mergeable part of every
/// aggregation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AggState {
    pub count: u64,
    pub sum: f64,
    pub sum2: f64,
    pub min: f64,
    pub max: f64,
}

impl AggState {
    pub fn add(&mut self, value: f64) {
        if self.count == 0 || value < self.min {
            self.min = value;
        }
        if self.count == 0 || value > self.max {
            self.max = value;
        }
        self.sum += value;
        self.sum2 += value * value;
        self.count += 1;
    }

    /// Fold in a state computed elsewhere, e.g. on a peer node
    pub fn merge(&mut self, other: &AggState) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 || other.min < self.min {
            self.min = other.min;
        }
        if self.count == 0 || other.max > self.max {
            self.max = other.max;
        }
        self.sum += other.sum;
        self.sum2 += other.sum2;
        self.count += other.count;
    }

    fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Merge per-engine states by name
pub fn merge_states(into: &mut BTreeMap<String, AggState>, from: &BTreeMap<String, AggState>) {
    for (name, state) in from {
        into.entry(name.clone()).or_default().merge(state);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Function {
    Avg,
    Sum,
    Min,
    Max,
    Count,
    Stats,
    ExtendedStats { sigma: f64 },
}

/// Field statistics collected over the DATA of structured records.
///
/// Requests look like `{"name": {"type": {"field": "a.b"}}}` with
/// type one of `avg`, `sum`, `min`, `max`, `value_count` (`count`),
/// `stats` and `extended_stats`. Functions over the same field and
/// `missing` value share one state.
#[derive(Debug, Clone)]
pub struct Aggregations {
    functions: BTreeMap<String, (Function, String)>,
    engines: BTreeMap<String, Engine>,
}

#[derive(Debug, Clone)]
struct Engine {
    path: Vec<String>,
    missing: Option<Value>,
    state: AggState,
}

impl Aggregations {
    /// `None` when nothing is requested
    pub fn parse(params: &Value) -> Result<Option<Self>> {
        let params = match params {
            Value::Null => return Ok(None),
            Value::Object(map) => map,
            _ => return Err(Error::option("aggregations must be an object")),
        };

        let mut aggs = Aggregations {
            functions: BTreeMap::new(),
            engines: BTreeMap::new(),
        };
        for (name, agg) in params {
            let (kind, opts) = match agg.as_object() {
                Some(obj) if obj.len() == 1 => obj.iter().next().map(|(k, v)| (k.as_str(), v)),
                _ => None,
            }
            .ok_or_else(|| Error::option(format!("{:?} contains invalid aggregation object", name)))?;

            let func = match kind {
                "avg" => Function::Avg,
                "sum" => Function::Sum,
                "min" => Function::Min,
                "max" => Function::Max,
                "value_count" | "count" => Function::Count,
                "stats" => Function::Stats,
                "extended_stats" => Function::ExtendedStats { sigma: sigma(opts)? },
                _ => return Err(Error::option(format!("{:?} is unknown aggregation type", kind))),
            };

            let field = opts
                .get("field")
                .ok_or_else(|| Error::option(r#"no "field" option found"#))?
                .as_str()
                .ok_or_else(|| Error::option(r#"bad "field" option found: not a string"#))?;
            let missing = opts.get("missing").cloned();

            let key = match &missing {
                Some(m) => format!("stat.{}/{}", field, m),
                None => format!("stat.{}", field),
            };
            aggs.engines.entry(key.clone()).or_insert_with(|| Engine {
                path: field.split('.').map(str::to_string).collect(),
                missing,
                state: AggState::default(),
            });
            aggs.functions.insert(name.clone(), (func, key));
        }

        if aggs.functions.is_empty() {
            return Ok(None);
        }
        Ok(Some(aggs))
    }

    /// Add one record DATA, which has to be a JSON document
    pub fn add(&mut self, data: &[u8]) -> Result<()> {
        let doc: Value = serde_json::from_slice(data)
            .map_err(|e| Error::format(format!("failed to parse record as JSON: {}", e)))?;

        for engine in self.engines.values_mut() {
            let value = match access(&doc, &engine.path) {
                Some(Value::Null) | None => engine.missing.as_ref(),
                found => found,
            };
            match value {
                None | Some(Value::Null) => {}
                Some(v) => engine.state.add(as_f64(v)?),
            }
        }
        Ok(())
    }

    /// Mergeable states, carried by the statistics
    pub fn states(&self) -> BTreeMap<String, AggState> {
        self.engines
            .iter()
            .map(|(name, engine)| (name.clone(), engine.state))
            .collect()
    }

    /// Final report for merged `states`, one entry per requested name
    pub fn render(&self, states: &BTreeMap<String, AggState>) -> Value {
        let mut out = Map::new();
        for (name, (func, key)) in &self.functions {
            let s = states.get(key).copied().unwrap_or_default();
            let some = |v: f64| if s.count > 0 { json!(v) } else { Value::Null };
            let value = match func {
                Function::Avg => json!({ "value": s.avg() }),
                Function::Sum => json!({ "value": s.sum }),
                Function::Min => json!({ "value": some(s.min) }),
                Function::Max => json!({ "value": some(s.max) }),
                Function::Count => json!({ "value": s.count }),
                Function::Stats => json!({
                    "avg": s.avg(),
                    "sum": s.sum,
                    "min": some(s.min),
                    "max": some(s.max),
                    "count": s.count,
                }),
                Function::ExtendedStats { sigma } => {
                    let var = s.avg().map(|avg| s.sum2 / s.count as f64 - avg * avg);
                    let dev = var.map(f64::sqrt);
                    let bound = |k: f64| s.avg().zip(dev).map(|(avg, dev)| avg + k * sigma * dev);
                    json!({
                        "avg": s.avg(),
                        "sum": s.sum,
                        "min": some(s.min),
                        "max": some(s.max),
                        "count": s.count,
                        "sum_of_squares": s.sum2,
                        "variance": var,
                        "std_deviation": dev,
                        "std_deviation_bounds": { "upper": bound(1.0), "lower": bound(-1.0) },
                    })
                }
            };
            out.insert(name.clone(), value);
        }
        Value::Object(out)
    }
}

fn sigma(opts: &Value) -> Result<f64> {
    match opts.get("sigma") {
        None => Ok(2.0),
        Some(v) => {
            let sigma = as_f64(v).map_err(|e| e.wrap(r#"bad "sigma" option"#))?;
            if sigma < 0.0 {
                return Err(Error::option(r#"bad "sigma" option: cannot be negative"#));
            }
            Ok(sigma)
        }
    }
}

// dotted path, numeric parts index arrays
fn access<'a>(doc: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(doc, |v, part| match v {
        Value::Object(map) => map.get(part),
        Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn as_f64(v: &Value) -> Result<f64> {
    match v {
        Value::Number(n) => n.as_f64().ok_or_else(|| Error::format(format!("{} is not a number", n))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| Error::format(format!("{:?} is not a number", s))),
        other => Err(Error::format(format!("{} is not a number", other))),
    }
}
