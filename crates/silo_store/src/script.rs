//! Script engine contract for user-defined functions.
//!
//! The embedded language runtime is an external collaborator; the node only
//! depends on this module's contract: apply a named `(module, function)` to a
//! record façade under a time tracker, and report success or failure with an
//! optional result value.
//!
//! The built-in engine is a registry of native functions. It gives tests and
//! single-node deployments a real apply path without pulling a language
//! runtime into the core.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use silo_proto::{Bin, FieldType, ParsedMsg, Particle};

use crate::stats::now_ns;

/// Maximum length of module and function names.
const NAME_MAX: usize = 64;

/// Script op types; background ops suppress the client response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScriptOpType {
    #[default]
    KeyValue,
    Background,
}

/// A parsed script call definition: module, function, packed argument list.
#[derive(Debug, Clone, Default)]
pub struct ScriptDef {
    pub module: String,
    pub function: String,
    pub arg_list: Vec<u8>,
    pub op_type: ScriptOpType,
}

impl ScriptDef {
    /// Extract the definition from a data message's UDF fields.
    pub fn from_msg(msg: &ParsedMsg) -> Option<ScriptDef> {
        let module = msg.field(FieldType::UdfFilename)?;
        let function = msg.field(FieldType::UdfFunction)?;
        let arg_list = msg.field(FieldType::UdfArgList)?;

        if module.len() > NAME_MAX || function.len() > NAME_MAX {
            return None;
        }

        let op_type = match msg.field(FieldType::UdfOp) {
            Some([2, ..]) => ScriptOpType::Background,
            _ => ScriptOpType::KeyValue,
        };

        Some(ScriptDef {
            module: String::from_utf8_lossy(module).into_owned(),
            function: String::from_utf8_lossy(function).into_owned(),
            arg_list: arg_list.to_vec(),
            op_type,
        })
    }
}

/// Deadline tracker installed into the engine per apply. The engine polls it
/// and aborts the script once past end-time.
pub struct TimeTracker {
    pub end_time_ns: u64,
}

impl TimeTracker {
    pub fn expired(&self) -> bool {
        self.end_time_ns != 0 && now_ns() > self.end_time_ns
    }
}

/// The record façade handed to scripts, backed by a storage read of the
/// record. Mutations accumulate here; classification of the resulting
/// operation reads the flags after the script returns.
#[derive(Debug, Default)]
pub struct ScriptRecord {
    /// Record is open (exists from the script's point of view).
    pub open: bool,
    /// Record existed before the script ran.
    pub preexists: bool,
    /// The script changed bin content.
    pub has_updates: bool,
    pub generation: u32,
    pub void_time: u32,
    pub set_name: Option<String>,
    pub bins: Vec<Bin>,
}

impl ScriptRecord {
    pub fn bin(&self, name: &str) -> Option<&Particle> {
        self.bins
            .iter()
            .find(|b| b.name == name)
            .map(|b| &b.value)
    }

    pub fn set_bin(&mut self, name: &str, value: Particle) {
        self.has_updates = true;
        self.open = true;
        match self.bins.iter_mut().find(|b| b.name == name) {
            Some(bin) => bin.value = value,
            None => self.bins.push(Bin::new(name, value)),
        }
    }

    pub fn remove_bin(&mut self, name: &str) {
        if let Some(at) = self.bins.iter().position(|b| b.name == name) {
            self.bins.remove(at);
            self.has_updates = true;
        }
    }

    /// Explicit record removal; the record is closed from the script's view.
    pub fn remove(&mut self) {
        self.open = false;
        self.has_updates = true;
    }

    pub fn bin_count(&self) -> usize {
        self.bins.len()
    }
}

/// Engine-level failure (as opposed to a script that ran and reported
/// failure).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    /// No such module/function.
    NotFound,
    /// The tracker expired mid-run.
    Timeout,
    /// The runtime itself failed.
    Runtime(String),
}

/// What the script reported: success flag plus an optional value, mirrored
/// back to the client in a SUCCESS or FAILURE bin.
#[derive(Debug, Clone)]
pub struct ScriptOutcome {
    pub success: bool,
    pub value: Particle,
}

impl ScriptOutcome {
    pub fn ok(value: Particle) -> ScriptOutcome {
        ScriptOutcome {
            success: true,
            value,
        }
    }

    pub fn fail(msg: &str) -> ScriptOutcome {
        ScriptOutcome {
            success: false,
            value: Particle::String(msg.into()),
        }
    }
}

pub trait ScriptEngine: Send + Sync {
    fn apply(
        &self,
        def: &ScriptDef,
        rec: &mut ScriptRecord,
        tracker: &TimeTracker,
    ) -> Result<ScriptOutcome, ScriptError>;
}

type NativeFn = Arc<
    dyn Fn(&mut ScriptRecord, &[u8], &TimeTracker) -> Result<ScriptOutcome, ScriptError>
        + Send
        + Sync,
>;

/// Registry-backed engine running native functions.
pub struct NativeScriptEngine {
    fns: RwLock<HashMap<(String, String), NativeFn>>,
}

impl NativeScriptEngine {
    pub fn new() -> NativeScriptEngine {
        NativeScriptEngine {
            fns: RwLock::new(HashMap::new()),
        }
    }

    pub fn register<F>(&self, module: &str, function: &str, f: F)
    where
        F: Fn(&mut ScriptRecord, &[u8], &TimeTracker) -> Result<ScriptOutcome, ScriptError>
            + Send
            + Sync
            + 'static,
    {
        self.fns
            .write()
            .unwrap()
            .insert((module.into(), function.into()), Arc::new(f));
    }
}

impl Default for NativeScriptEngine {
    fn default() -> Self {
        NativeScriptEngine::new()
    }
}

impl ScriptEngine for NativeScriptEngine {
    fn apply(
        &self,
        def: &ScriptDef,
        rec: &mut ScriptRecord,
        tracker: &TimeTracker,
    ) -> Result<ScriptOutcome, ScriptError> {
        if tracker.expired() {
            return Err(ScriptError::Timeout);
        }

        let f = {
            let fns = self.fns.read().unwrap();
            fns.get(&(def.module.clone(), def.function.clone())).cloned()
        };

        match f {
            Some(f) => f(rec, &def.arg_list, tracker),
            None => Err(ScriptError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facade_tracks_updates() {
        let mut rec = ScriptRecord {
            open: true,
            preexists: true,
            bins: vec![Bin::new("c", Particle::Integer(10))],
            ..Default::default()
        };
        assert!(!rec.has_updates);
        rec.set_bin("c", Particle::Integer(11));
        assert!(rec.has_updates);
        rec.remove_bin("c");
        assert_eq!(rec.bin_count(), 0);
        rec.remove();
        assert!(!rec.open);
    }

    #[test]
    fn native_engine_dispatches() {
        let engine = NativeScriptEngine::new();
        engine.register("math", "incr", |rec, _args, _t| {
            let v = match rec.bin("n") {
                Some(Particle::Integer(v)) => *v,
                _ => 0,
            };
            rec.set_bin("n", Particle::Integer(v + 1));
            Ok(ScriptOutcome::ok(Particle::Integer(v + 1)))
        });

        let def = ScriptDef {
            module: "math".into(),
            function: "incr".into(),
            ..Default::default()
        };
        let mut rec = ScriptRecord {
            open: true,
            preexists: true,
            ..Default::default()
        };
        let tracker = TimeTracker { end_time_ns: 0 };

        let out = engine.apply(&def, &mut rec, &tracker).unwrap();
        assert!(out.success);
        assert_eq!(rec.bin("n"), Some(&Particle::Integer(1)));
    }

    #[test]
    fn missing_function_is_engine_error() {
        let engine = NativeScriptEngine::new();
        let def = ScriptDef {
            module: "none".into(),
            function: "nope".into(),
            ..Default::default()
        };
        let mut rec = ScriptRecord::default();
        let tracker = TimeTracker { end_time_ns: 0 };
        assert_eq!(
            engine.apply(&def, &mut rec, &tracker).unwrap_err(),
            ScriptError::NotFound
        );
    }

    #[test]
    fn expired_tracker_aborts() {
        let engine = NativeScriptEngine::new();
        let def = ScriptDef::default();
        let mut rec = ScriptRecord::default();
        let tracker = TimeTracker { end_time_ns: 1 };
        assert_eq!(
            engine.apply(&def, &mut rec, &tracker).unwrap_err(),
            ScriptError::Timeout
        );
    }
}
