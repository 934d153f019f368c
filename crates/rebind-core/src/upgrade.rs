//! Format upgrade of protocol 2 stores
//!
//! An upgrade run rewrites every record so it can be read by a Python 3
//! host: well known classes that moved get default rename rules, date and
//! time payloads become bytes, object ids inside references become bytes
//! and, when an encoding is configured, every remaining protocol 2 string
//! becomes text.

use crate::decode::{decode_with_fallbacks, TextEncoding};
use crate::error::MigrationResult;
use rebind_pickle::{Construct, Heap, ObjId, Object, Value};
use std::collections::HashSet;
use rebind_symbol::{ClassDescriptor, RenameRules, WarningLog};

/// Date and time classes whose first constructor argument is a byte payload
const DATETIME_CLASSES: [&str; 3] = ["datetime", "date", "time"];

/// Rename rules applied by every upgrade run
///
/// Rules loaded from configuration take precedence over these.
#[must_use]
pub fn default_renames() -> RenameRules {
    RenameRules::new()
        .with(
            ClassDescriptor::new("UserDict", "UserDict"),
            ClassDescriptor::new("collections", "UserDict"),
        )
        .with(
            ClassDescriptor::new("__builtin__", "set"),
            ClassDescriptor::new("builtins", "set"),
        )
}

/// Settings of an upgrade run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeSettings {
    /// Encoding of protocol 2 strings; `None` keeps them as they are
    pub encoding: Option<TextEncoding>,
    /// Encodings tried when `encoding` fails
    pub fallbacks: Vec<TextEncoding>,
}

impl UpgradeSettings {
    /// Upgrade without converting protocol 2 strings
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode protocol 2 strings with `encoding`
    #[must_use]
    pub fn with_encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    /// Fallback encodings
    #[must_use]
    pub fn with_fallbacks(mut self, fallbacks: Vec<TextEncoding>) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    /// Convert one loaded record
    ///
    /// # Errors
    /// Returns error if a string cannot be decoded by any encoding.
    pub fn apply(
        &self,
        roots: &mut [Value],
        heap: &mut Heap,
        warnings: &mut WarningLog,
    ) -> MigrationResult<bool> {
        let mut changed = fix_datetime_arguments(heap);
        if let Some(encoding) = self.encoding {
            let mut sweep = Sweep {
                encoding,
                fallbacks: &self.fallbacks,
                warnings,
                changed: false,
                seen: HashSet::new(),
                pending: Vec::new(),
            };
            for root in roots.iter_mut() {
                sweep.value(root, None)?;
            }
            while let Some(id) = sweep.pending.pop() {
                if let Some(object) = heap.get_mut(id) {
                    sweep.object(object)?;
                }
            }
            changed |= sweep.changed;
        }
        Ok(changed)
    }
}

/// Re-tag the payload argument of date and time reductions as bytes
pub fn fix_datetime_arguments(heap: &mut Heap) -> bool {
    let mut changed = false;
    for object in heap.iter_mut() {
        let Object::Instance(instance) = object else {
            continue;
        };
        let Construct::Reduce { callable, args } = &mut instance.construct else {
            continue;
        };
        let is_datetime = callable.as_global().is_some_and(|global| {
            global.module() == "datetime" && DATETIME_CLASSES.contains(&global.name())
        });
        if !is_datetime {
            continue;
        }
        if let Value::Tuple(items) = args {
            if let Some(first) = items.first_mut() {
                if let Value::LegacyString(bytes) = first {
                    let bytes = std::mem::take(bytes);
                    *first = Value::Bytes(bytes);
                    changed = true;
                }
            }
        }
    }
    changed
}

/// Decodes the strings reachable from a record's roots
///
/// Persistent ids are opaque: their object ids stay bytes and the lists
/// holding list-shaped ids are never visited.
struct Sweep<'a> {
    encoding: TextEncoding,
    fallbacks: &'a [TextEncoding],
    warnings: &'a mut WarningLog,
    changed: bool,
    seen: HashSet<ObjId>,
    pending: Vec<ObjId>,
}

impl Sweep<'_> {
    fn value(&mut self, value: &mut Value, attribute: Option<&str>) -> MigrationResult<()> {
        match value {
            Value::LegacyString(bytes) => {
                let text = decode_with_fallbacks(
                    bytes,
                    attribute.unwrap_or("<item>"),
                    self.encoding,
                    self.fallbacks,
                    self.warnings,
                )?;
                *value = Value::Str(text);
                self.changed = true;
            }
            Value::Tuple(items) => {
                for item in items {
                    self.value(item, attribute)?;
                }
            }
            Value::Ref(id) => {
                if self.seen.insert(*id) {
                    self.pending.push(*id);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn items(&mut self, items: &mut [Value]) -> MigrationResult<()> {
        for item in items {
            self.value(item, None)?;
        }
        Ok(())
    }

    fn pairs(&mut self, pairs: &mut [(Value, Value)]) -> MigrationResult<()> {
        for (key, value) in pairs {
            self.value(key, None)?;
            let attribute = key.as_str().map(str::to_owned);
            self.value(value, attribute.as_deref())?;
        }
        Ok(())
    }

    fn object(&mut self, object: &mut Object) -> MigrationResult<()> {
        match object {
            Object::List(items) | Object::Set(items) | Object::FrozenSet(items) => {
                self.items(items)
            }
            Object::Dict(pairs) => self.pairs(pairs),
            Object::Instance(instance) => {
                match &mut instance.construct {
                    Construct::Reduce { args, .. } | Construct::NewObj { args, .. } => {
                        self.value(args, None)?;
                    }
                    Construct::NewObjEx { args, kwargs, .. } => {
                        self.value(args, None)?;
                        self.value(kwargs, None)?;
                    }
                    Construct::Inst { args, .. } => self.items(args)?,
                }
                self.items(&mut instance.list_items)?;
                self.pairs(&mut instance.dict_items)?;
                self.items(&mut instance.state)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rebind_pickle::{Global, Instance};

    fn reduce(heap: &mut Heap, module: &str, name: &str, payload: &[u8]) -> Value {
        Value::Ref(heap.alloc(Object::Instance(Instance::new(Construct::Reduce {
            callable: Value::Global(Global::new(module, name)),
            args: Value::Tuple(vec![Value::LegacyString(payload.to_vec())]),
        }))))
    }

    fn first_arg(heap: &Heap, value: &Value) -> Value {
        let instance = heap.instance(value.as_ref_id().unwrap()).unwrap();
        match &instance.construct {
            Construct::Reduce { args, .. } => args.as_tuple().unwrap()[0].clone(),
            other => panic!("unexpected construct {other:?}"),
        }
    }

    #[test]
    fn default_renames_cover_builtins() {
        let rules = default_renames();
        assert_eq!(
            rules.get(&ClassDescriptor::new("__builtin__", "set")),
            Some(&ClassDescriptor::new("builtins", "set"))
        );
        assert_eq!(rules.len(), 2);
    }

    #[test]
    fn datetime_payloads_become_bytes() {
        let mut heap = Heap::new();
        let date = reduce(&mut heap, "datetime", "date", b"\x07\xe2\x0c\x0c");
        let other = reduce(&mut heap, "module1", "Data", b"abc");

        assert!(fix_datetime_arguments(&mut heap));
        assert_eq!(first_arg(&heap, &date), Value::Bytes(b"\x07\xe2\x0c\x0c".to_vec()));
        assert_eq!(first_arg(&heap, &other), Value::LegacyString(b"abc".to_vec()));
        assert!(!fix_datetime_arguments(&mut heap));
    }

    #[test]
    fn sweep_decodes_strings_but_not_references() {
        let mut heap = Heap::new();
        let pid = Value::Persistent(Box::new(Value::LegacyString(vec![0, 1])));
        let dict = heap.alloc(Object::Dict(vec![
            (Value::LegacyString(b"title".to_vec()), Value::LegacyString(b"caf\xe9".to_vec())),
            (Value::LegacyString(b"other".to_vec()), pid.clone()),
        ]));
        let mut roots = vec![Value::Global(Global::new("module1", "Factory")), Value::Ref(dict)];

        let settings = UpgradeSettings::new()
            .with_encoding(TextEncoding::Ascii)
            .with_fallbacks(vec![TextEncoding::Latin1]);
        let mut warnings = WarningLog::new();
        assert!(settings.apply(&mut roots, &mut heap, &mut warnings).unwrap());

        assert_eq!(
            heap.dict(dict).unwrap(),
            &[
                (Value::str("title"), Value::str("café")),
                (Value::str("other"), pid),
            ]
        );
        assert_eq!(
            warnings.messages().collect::<Vec<_>>(),
            vec!["Encoding fallback to \"latin-1\" while decoding attribute \"title\""]
        );
    }

    #[test]
    fn sweep_leaves_list_references_alone() {
        let mut heap = Heap::new();
        let oid = Value::LegacyString(vec![0, 0, 0, 0, 0, 0, 0, 0x80]);
        let weak = heap.alloc(Object::List(vec![oid.clone()]));
        let detached = heap.alloc(Object::List(vec![oid.clone()]));
        let dict = heap.alloc(Object::Dict(vec![(
            Value::LegacyString(b"ref".to_vec()),
            Value::Persistent(Box::new(Value::Ref(weak))),
        )]));
        let mut roots = vec![Value::Global(Global::new("module1", "Factory")), Value::Ref(dict)];

        let settings = UpgradeSettings::new().with_encoding(TextEncoding::Ascii);
        assert!(settings
            .apply(&mut roots, &mut heap, &mut WarningLog::new())
            .unwrap());

        assert_eq!(heap.get(weak), Some(&Object::List(vec![oid.clone()])));
        assert_eq!(heap.get(detached), Some(&Object::List(vec![oid])));
        assert_eq!(heap.dict(dict).unwrap()[0].0, Value::str("ref"));
    }

    #[test]
    fn sweep_runs_after_datetime_fix() {
        let mut heap = Heap::new();
        let date = reduce(&mut heap, "datetime", "date", b"\x07\xe2\x0c\x0c");
        let settings = UpgradeSettings::new().with_encoding(TextEncoding::Latin1);
        settings
            .apply(&mut [date.clone()], &mut heap, &mut WarningLog::new())
            .unwrap();
        assert_eq!(first_arg(&heap, &date), Value::Bytes(b"\x07\xe2\x0c\x0c".to_vec()));
    }

    #[test]
    fn no_encoding_keeps_strings() {
        let mut heap = Heap::new();
        let mut roots = vec![Value::LegacyString(b"abc".to_vec())];
        assert!(!UpgradeSettings::new()
            .apply(&mut roots, &mut heap, &mut WarningLog::new())
            .unwrap());
        assert_eq!(roots[0], Value::LegacyString(b"abc".to_vec()));
    }
}
