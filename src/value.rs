//! The evaluator contract: `Value`, `BasilDict`, `Program`, `Environment`,
//! and the `Evaluator` trait boundary (spec.md §3, §9).
//!
//! The script language itself is an external collaborator. This module
//! models the closed shape the core consumes from it and nothing more.

use std::any::Any;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, Weak};

use serde::Serialize;

use crate::error::ParseError;

/// Discriminated union produced by the evaluator (spec.md §3).
///
/// Modeled as a closed tagged sum matched exhaustively at every consumer
/// (ResponseWriter, ApiDispatcher, ErrorRenderer) rather than via subtype
/// polymorphism, per spec.md §9.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Boolean(bool),
    String(String),
    Array(Vec<Value>),
    Dictionary(BasilDict),
    Error(crate::error::RuntimeError),
    Redirect(RedirectValue),
    /// An opaque callable the core never invokes directly.
    Function(Arc<dyn Any + Send + Sync>),
}

impl Value {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BasilDict> {
        match self {
            Value::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    /// Convert to `serde_json::Value`, preserving dictionary key order
    /// (spec.md §8 round-trip property).
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Integer(i) => serde_json::json!(i),
            Value::Float(f) => serde_json::json!(f),
            Value::Boolean(b) => serde_json::json!(b),
            Value::String(s) => serde_json::json!(s),
            Value::Array(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Dictionary(d) => d.to_json(),
            Value::Error(e) => serde_json::json!({ "error": e.message }),
            Value::Redirect(r) => serde_json::json!({ "redirect": r.url, "status": r.status }),
            Value::Function(_) => serde_json::Value::Null,
        }
    }
}

/// A 3xx redirect value. `status` is validated to the 300–308 range at
/// construction time (spec.md §4.9 step 10); out-of-range numbers never
/// reach here because the evaluator contract produces an `Error` instead.
#[derive(Debug, Clone)]
pub struct RedirectValue {
    pub url: String,
    pub status: u16,
}

impl RedirectValue {
    pub fn new(url: impl Into<String>, status: u16) -> Result<Self, crate::error::RuntimeError> {
        if !(300..=308).contains(&status) {
            return Err(crate::error::RuntimeError {
                message: format!("invalid redirect status {status}"),
                file: None,
                line: None,
                column: None,
                hint: None,
                class: Some("runtime".into()),
                user_dict: None,
            });
        }
        Ok(Self { url: url.into(), status })
    }
}

/// A single slot in a `BasilDict`: either a value already evaluated, or an
/// un-evaluated key expression re-evaluated lazily against the owning
/// Environment on read (spec.md §9).
#[derive(Clone)]
enum DictSlot {
    Value(Value),
    Lazy(Arc<dyn Fn(&Environment) -> Value + Send + Sync>),
}

impl std::fmt::Debug for DictSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DictSlot::Value(v) => write!(f, "Value({v:?})"),
            DictSlot::Lazy(_) => write!(f, "Lazy(..)"),
        }
    }
}

/// An ordered string-keyed map, preserving insertion order the way the
/// evaluator's Dictionary does (spec.md §3).
#[derive(Debug, Default)]
struct OrderedMap {
    order: Vec<String>,
    index: HashMap<String, usize>,
    slots: Vec<DictSlot>,
}

impl OrderedMap {
    fn insert(&mut self, key: String, slot: DictSlot) {
        if let Some(&i) = self.index.get(&key) {
            self.slots[i] = slot;
        } else {
            self.index.insert(key.clone(), self.slots.len());
            self.order.push(key);
            self.slots.push(slot);
        }
    }

    fn get(&self, key: &str) -> Option<&DictSlot> {
        self.index.get(key).map(|&i| &self.slots[i])
    }

    fn remove(&mut self, key: &str) -> Option<DictSlot> {
        let i = self.index.remove(key)?;
        self.order.retain(|k| k != key);
        for idx in self.index.values_mut() {
            if *idx > i {
                *idx -= 1;
            }
        }
        Some(self.slots.remove(i))
    }

    fn keys(&self) -> impl Iterator<Item = &String> {
        self.order.iter()
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// A Dictionary (string→Value mapping with recorded key-order), carrying a
/// weak back-pointer to the Environment it was evaluated in so that lazily
/// stored key expressions can be re-evaluated on read (spec.md §3, §9).
///
/// The back-pointer is `Weak`, not `Arc`: Environments never hold strong
/// references to the Dictionaries they produce, so no reference cycle
/// forms and a Dictionary can still outlive the request if a caller clones
/// it out of the response path (it simply loses the ability to re-evaluate
/// lazy slots once the Environment drops).
#[derive(Debug, Clone)]
pub struct BasilDict {
    inner: Arc<RwLock<OrderedMap>>,
    env: Weak<EnvironmentInner>,
}

impl BasilDict {
    pub fn new(env: &Environment) -> Self {
        Self {
            inner: Arc::new(RwLock::new(OrderedMap::default())),
            env: Arc::downgrade(&env.inner),
        }
    }

    /// A Dictionary with no owning Environment (e.g. one built purely from
    /// request data before an Environment exists, such as
    /// `RequestContextBuilder`'s output).
    pub fn detached() -> Self {
        Self {
            inner: Arc::new(RwLock::new(OrderedMap::default())),
            env: Weak::new(),
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.inner.write().unwrap().insert(key.into(), DictSlot::Value(value));
    }

    pub fn insert_lazy(
        &self,
        key: impl Into<String>,
        thunk: impl Fn(&Environment) -> Value + Send + Sync + 'static,
    ) {
        self.inner.write().unwrap().insert(key.into(), DictSlot::Lazy(Arc::new(thunk)));
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        let slot = self.inner.write().unwrap().remove(key)?;
        self.resolve(slot)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let slot = {
            let guard = self.inner.read().unwrap();
            match guard.get(key) {
                Some(DictSlot::Value(v)) => return Some(v.clone()),
                Some(lazy @ DictSlot::Lazy(_)) => lazy.clone(),
                None => return None,
            }
        };
        self.resolve(slot)
    }

    fn resolve(&self, slot: DictSlot) -> Option<Value> {
        match slot {
            DictSlot::Value(v) => Some(v),
            DictSlot::Lazy(thunk) => {
                let env = self.env.upgrade()?;
                Some(thunk(&Environment { inner: env }))
            }
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.read().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_json(&self) -> serde_json::Value {
        let keys = self.keys();
        let mut map = serde_json::Map::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(&key) {
                map.insert(key, value.to_json());
            }
        }
        serde_json::Value::Object(map)
    }
}

impl Serialize for BasilDict {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

/// Opaque parsed AST, immutable, produced by `ScriptCache` (spec.md §3).
/// The core never inspects its contents.
#[derive(Clone)]
pub struct Program(Arc<dyn Any + Send + Sync>);

impl Program {
    pub fn new(inner: impl Any + Send + Sync) -> Self {
        Self(Arc::new(inner))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Program(..)")
    }
}

/// The per-request security policy (spec.md §4.9 step 7): no writes, reads
/// disallowed under sensitive system directories, executes confined to the
/// script's own directory tree.
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    pub allow_writes: bool,
    pub denied_read_prefixes: Vec<PathBuf>,
    pub execute_root: PathBuf,
}

impl SecurityPolicy {
    pub fn standard(execute_root: PathBuf) -> Self {
        Self {
            allow_writes: false,
            denied_read_prefixes: vec!["/etc".into(), "/var".into(), "/root".into()],
            execute_root,
        }
    }

    pub fn can_read(&self, path: &std::path::Path) -> bool {
        !self
            .denied_read_prefixes
            .iter()
            .any(|denied| path.starts_with(denied))
    }

    pub fn can_execute(&self, path: &std::path::Path) -> bool {
        path.starts_with(&self.execute_root)
    }
}

struct EnvironmentInner {
    filename: RwLock<Option<PathBuf>>,
    root_path: PathBuf,
    security_policy: RwLock<Option<SecurityPolicy>>,
    basil: RwLock<Option<BasilDict>>,
}

/// Mutable per-request binding table (spec.md §3). One Environment is
/// constructed per request and discarded when the response is written; it
/// is never shared between requests and never `Clone`.
pub struct Environment {
    inner: Arc<EnvironmentInner>,
}

impl Environment {
    pub fn new(root_path: PathBuf) -> Self {
        Self {
            inner: Arc::new(EnvironmentInner {
                filename: RwLock::new(None),
                root_path,
                security_policy: RwLock::new(None),
                basil: RwLock::new(None),
            }),
        }
    }

    pub fn set_filename(&mut self, filename: PathBuf) {
        *self.inner.filename.write().unwrap() = Some(filename);
    }

    pub fn filename(&self) -> Option<PathBuf> {
        self.inner.filename.read().unwrap().clone()
    }

    pub fn root_path(&self) -> &PathBuf {
        &self.inner.root_path
    }

    /// Set the security policy. Invariant (spec.md §3 invariant 3): this
    /// must be called before the first `Eval` and never again.
    pub fn set_security_policy(&mut self, policy: SecurityPolicy) {
        let mut guard = self.inner.security_policy.write().unwrap();
        assert!(guard.is_none(), "security policy set more than once");
        *guard = Some(policy);
    }

    pub fn security_policy(&self) -> SecurityPolicy {
        self.inner
            .security_policy
            .read()
            .unwrap()
            .clone()
            .expect("security policy not set before Eval")
    }

    /// Inject the protected `basil` binding (spec.md §3).
    pub fn set_basil(&mut self, basil: BasilDict) {
        *self.inner.basil.write().unwrap() = Some(basil);
    }

    pub fn basil(&self) -> BasilDict {
        self.inner
            .basil
            .read()
            .unwrap()
            .clone()
            .expect("basil context not injected")
    }
}

/// The evaluator trait boundary (spec.md §1: "the core consumes a
/// `Program` AST, an `Environment`, and an `Eval` function from it").
pub trait Evaluator: Send + Sync {
    fn parse(&self, source: &str, path: &std::path::Path) -> Result<Program, ParseError>;
    fn eval(&self, program: &Program, env: &mut Environment) -> Value;

    /// Invokes an exported `Value::Function` with a single request argument
    /// (spec.md §4.10 step 7). The core never inspects the callable itself.
    fn call(&self, func: &Value, arg: Value) -> Value;

    /// Clears the module import cache so each request sees fresh imports
    /// (spec.md §4.9 step 3). A no-op for evaluators without one.
    fn clear_module_cache(&self) {}
}

/// A test double standing in for the real script language, which is out of
/// scope per spec.md §1. Parses nothing; evaluates to whatever canned
/// `Value` it is configured with.
pub struct NullEvaluator {
    pub result: Value,
}

impl Evaluator for NullEvaluator {
    fn parse(&self, _source: &str, path: &std::path::Path) -> Result<Program, ParseError> {
        Ok(Program::new(path.to_path_buf()))
    }

    fn eval(&self, _program: &Program, _env: &mut Environment) -> Value {
        self.result.clone()
    }

    fn call(&self, _func: &Value, _arg: Value) -> Value {
        self.result.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dict_preserves_insertion_order() {
        let env = Environment::new(PathBuf::from("/tmp"));
        let dict = BasilDict::new(&env);
        dict.insert("b", Value::Integer(2));
        dict.insert("a", Value::Integer(1));
        assert_eq!(dict.keys(), vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn dict_overwrite_keeps_original_position() {
        let env = Environment::new(PathBuf::from("/tmp"));
        let dict = BasilDict::new(&env);
        dict.insert("a", Value::Integer(1));
        dict.insert("b", Value::Integer(2));
        dict.insert("a", Value::Integer(99));
        assert_eq!(dict.keys(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(dict.get("a").unwrap().as_integer(), Some(99));
    }

    #[test]
    fn lazy_slot_reevaluates_against_environment() {
        let env = Environment::new(PathBuf::from("/tmp"));
        let dict = BasilDict::new(&env);
        dict.insert_lazy("name", |env| Value::String(env.root_path().display().to_string()));
        assert_eq!(dict.get("name").unwrap().as_str(), Some("/tmp"));
    }

    #[test]
    fn redirect_rejects_out_of_range_status() {
        assert!(RedirectValue::new("/x", 200).is_err());
        assert!(RedirectValue::new("/x", 301).is_ok());
        assert!(RedirectValue::new("/x", 308).is_ok());
        assert!(RedirectValue::new("/x", 309).is_err());
    }

    #[test]
    fn to_json_roundtrips_nested_structures() {
        let env = Environment::new(PathBuf::from("/tmp"));
        let dict = BasilDict::new(&env);
        dict.insert("ok", Value::Boolean(true));
        dict.insert("items", Value::Array(vec![Value::Integer(1), Value::Integer(2)]));
        let json = Value::Dictionary(dict).to_json();
        assert_eq!(json["ok"], serde_json::json!(true));
        assert_eq!(json["items"], serde_json::json!([1, 2]));
    }
}
