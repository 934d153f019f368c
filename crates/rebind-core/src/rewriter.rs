//! RecordRewriter - rewrites class references inside one record
//!
//! A record is two pickles sharing one memo: the class metadata and the
//! state. Loading goes through [`RecordHooks`], which resolves every class
//! global and intercepts every persistent reference. The record is written
//! back only when something changed, or always when repickling everything.
//!
//! ```text
//! Parsing -> Resolving -> Decoding -> Unchanged | Rewriting -> Done
//!    |                                               |
//!    +-> Skipped                                     +-> SerializeFailed
//! ```

use crate::config::RunConfig;
use crate::decode::DecoderRegistry;
use crate::error::{MigrationError, MigrationResult};
use crate::reference::ReferenceInterceptor;
use crate::upgrade::UpgradeSettings;
use rebind_pickle::{
    dump_all, Global, Heap, HookError, LoadHooks, Object, Protocol, Unpickler, Value,
};
use rebind_store::Oid;
use rebind_symbol::{
    BrokenTypeRegistry, ClassDescriptor, RenameRules, Resolution, SymbolResolver, WarningLog,
};

/// Result of rewriting one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing to write
    Unchanged,
    /// Class metadata is on the skip list; the state was not parsed
    Skipped,
    /// New payload to store
    Rewritten(Vec<u8>),
    /// The changed record cannot be written at the target protocol
    SerializeFailed,
}

/// Load hooks used for both pickles of a record
struct RecordHooks<'r> {
    resolver: &'r mut SymbolResolver,
    broken: &'r mut BrokenTypeRegistry,
    warnings: &'r mut WarningLog,
    interceptor: ReferenceInterceptor,
    changed: bool,
    skipped: bool,
}

impl RecordHooks<'_> {
    /// New descriptor for `descriptor` if a rule or the registry renames it
    fn rename(&mut self, descriptor: &ClassDescriptor) -> Option<ClassDescriptor> {
        match self.resolver.resolve(descriptor, self.warnings) {
            Resolution::Renamed(target) => {
                self.changed = true;
                Some(target)
            }
            Resolution::Skipped | Resolution::Unchanged | Resolution::Broken(_) => None,
        }
    }
}

impl LoadHooks for RecordHooks<'_> {
    fn find_class(&mut self, module: &str, name: &str) -> Result<Value, HookError> {
        let descriptor = ClassDescriptor::new(module, name);
        let global = match self.resolver.resolve(&descriptor, self.warnings) {
            Resolution::Renamed(target) => {
                self.changed = true;
                target.to_global()
            }
            Resolution::Broken(missing) => self.broken.register(&missing).to_global(),
            Resolution::Skipped => {
                self.skipped = true;
                Global::new(module, name)
            }
            Resolution::Unchanged => Global::new(module, name),
        };
        Ok(Value::Global(global))
    }

    fn persistent_load(&mut self, pid: Value, heap: &mut Heap) -> Result<Value, HookError> {
        let interceptor = self.interceptor;
        let (value, renamed) = interceptor
            .intercept(pid, heap, &mut |descriptor| self.rename(descriptor))
            .map_err(|err| Box::new(err) as HookError)?;
        self.changed |= renamed;
        Ok(value)
    }
}

/// Where the class of a record is spelled in its class metadata
enum ClassMeta {
    /// `cls`
    Class(ClassDescriptor),
    /// `(cls, args)`
    ClassWithArgs(ClassDescriptor),
    /// `((module, name), args)`
    Pair(ClassDescriptor),
}

impl ClassMeta {
    fn classify(oid: Oid, value: &Value) -> MigrationResult<Self> {
        let unknown = |kind| MigrationError::UnknownClassMetadata { oid, kind };
        match value {
            Value::Global(global) => Ok(Self::Class(ClassDescriptor::of_global(global))),
            Value::Tuple(items) => match items.as_slice() {
                [Value::Global(global), _] => {
                    Ok(Self::ClassWithArgs(ClassDescriptor::of_global(global)))
                }
                [Value::Tuple(pair), _] => match pair.as_slice() {
                    [module, name] => match (module.string_bytes(), name.string_bytes()) {
                        (Some(module), Some(name)) => Ok(Self::Pair(ClassDescriptor::new(
                            String::from_utf8_lossy(module),
                            String::from_utf8_lossy(name),
                        ))),
                        _ => Err(unknown("class pair")),
                    },
                    _ => Err(unknown("class pair")),
                },
                _ => Err(unknown("tuple")),
            },
            other => Err(unknown(other.kind())),
        }
    }

    fn descriptor(&self) -> &ClassDescriptor {
        match self {
            Self::Class(descriptor) | Self::ClassWithArgs(descriptor) | Self::Pair(descriptor) => {
                descriptor
            }
        }
    }
}

/// Replace the `(module, name)` pair of `((module, name), args)`
fn rename_pair(class_meta: &mut Value, target: &ClassDescriptor) {
    if let Value::Tuple(items) = class_meta {
        if let Some(Value::Tuple(pair)) = items.first_mut() {
            let legacy = matches!(pair.first(), Some(Value::LegacyString(_)));
            let text = |part: &str| {
                if legacy {
                    Value::LegacyString(part.as_bytes().to_vec())
                } else {
                    Value::str(part)
                }
            };
            *pair = vec![text(target.module()), text(target.name())];
        }
    }
}

/// Rewrites records one at a time, keeping run-wide state between them
#[derive(Debug)]
pub struct RecordRewriter {
    resolver: SymbolResolver,
    broken: BrokenTypeRegistry,
    decoders: DecoderRegistry,
    warnings: WarningLog,
    interceptor: ReferenceInterceptor,
    protocol: Protocol,
    repickle_all: bool,
    upgrade: Option<UpgradeSettings>,
}

impl RecordRewriter {
    /// Create rewriter for one run
    #[must_use]
    pub fn new(resolver: SymbolResolver, decoders: DecoderRegistry, config: &RunConfig) -> Self {
        let mut interceptor = ReferenceInterceptor::new(config.protocol);
        if config.upgrade.is_some() {
            interceptor = interceptor.normalizing_oids();
        }
        Self {
            resolver,
            broken: BrokenTypeRegistry::new(),
            decoders,
            warnings: WarningLog::new(),
            interceptor,
            protocol: config.protocol,
            repickle_all: config.repickles_all(),
            upgrade: config.upgrade.clone(),
        }
    }

    /// Rewrite the payload of record `oid`
    ///
    /// # Errors
    /// Returns error for malformed payloads, unknown reference shapes and
    /// exhausted attribute decoding.
    pub fn rewrite(&mut self, oid: Oid, payload: &[u8]) -> MigrationResult<Outcome> {
        let mut hooks = RecordHooks {
            resolver: &mut self.resolver,
            broken: &mut self.broken,
            warnings: &mut self.warnings,
            interceptor: self.interceptor,
            changed: false,
            skipped: false,
        };
        let mut unpickler = Unpickler::new(payload, &mut hooks);

        let mut class_meta = unpickler
            .load()
            .map_err(|err| MigrationError::from_decode(oid, err))?;
        let meta = ClassMeta::classify(oid, &class_meta)?;
        let hooks_ref = unpickler.hooks_mut();
        // A bare global or a `(cls, args)` tuple is skipped when any global
        // loaded from it is skip-listed, constructor arguments included.
        let skipped = match &meta {
            ClassMeta::Pair(descriptor) => hooks_ref.resolver.is_skipped(descriptor),
            ClassMeta::Class(_) | ClassMeta::ClassWithArgs(_) => hooks_ref.skipped,
        };
        if skipped {
            tracing::debug!(%oid, class = %meta.descriptor(), "skipped record");
            return Ok(Outcome::Skipped);
        }
        let mut class = meta.descriptor().clone();
        if let ClassMeta::Pair(descriptor) = &meta {
            if let Some(target) = unpickler.hooks_mut().rename(descriptor) {
                rename_pair(&mut class_meta, &target);
                class = target;
            }
        }

        let state = unpickler
            .load()
            .map_err(|err| MigrationError::from_decode(oid, err))?;
        if !unpickler.is_at_end() {
            return Err(MigrationError::Malformed {
                oid,
                source: rebind_pickle::DecodeError::malformed(
                    "trailing data after state",
                    unpickler.position(),
                ),
            });
        }
        let mut heap = unpickler.into_heap();
        let mut changed = hooks.changed;

        if let Some(id) = state.as_ref_id() {
            if let Some(Object::Dict(items)) = heap.get_mut(id) {
                changed |= self.decoders.apply(&class, items, &mut self.warnings)?;
            }
        }

        let mut roots = [class_meta, state];
        if let Some(upgrade) = &self.upgrade {
            changed |= upgrade.apply(&mut roots, &mut heap, &mut self.warnings)?;
        }

        if !changed && !self.repickle_all {
            return Ok(Outcome::Unchanged);
        }
        match dump_all(&roots, &heap, self.protocol) {
            Ok(bytes) => Ok(Outcome::Rewritten(bytes)),
            Err(err) => {
                tracing::error!(%oid, "Error: cannot pickle modified record: {err}");
                Ok(Outcome::SerializeFailed)
            }
        }
    }

    /// Rules discovered from the type registry so far
    #[inline]
    #[must_use]
    pub fn implicit_rules(&self) -> &RenameRules {
        self.resolver.implicit_rules()
    }

    /// Union of the selected rule tables
    #[must_use]
    pub fn rules(&self, implicit: bool, explicit: bool) -> RenameRules {
        self.resolver.rules(implicit, explicit)
    }

    /// Warnings emitted so far
    #[inline]
    #[must_use]
    pub fn warnings(&self) -> &WarningLog {
        &self.warnings
    }

    /// Placeholders created for missing types
    #[inline]
    #[must_use]
    pub fn broken_types(&self) -> &BrokenTypeRegistry {
        &self.broken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{DecodeAttribute, EncodeBinary, TextEncoding};
    use pretty_assertions::assert_eq;
    use rebind_symbol::{OpenRegistry, SkipSet, TypeCatalog};

    fn d(text: &str) -> ClassDescriptor {
        text.parse().unwrap()
    }

    fn catalog() -> TypeCatalog {
        let mut catalog = TypeCatalog::new();
        catalog
            .define(d("module1 NewFactory"))
            .alias(d("module1 Factory"), d("module1 NewFactory"))
            .define(d("module2 OtherFactory"));
        catalog
    }

    fn rewriter(resolver: SymbolResolver) -> RecordRewriter {
        RecordRewriter::new(resolver, DecoderRegistry::new(), &RunConfig::new())
    }

    #[test]
    fn implicit_rename_rewrites_class() {
        let mut rewriter = rewriter(SymbolResolver::new(catalog()));
        let payload = b"\x80\x03cmodule1\nFactory\nq\x00.\x80\x03}q\x01.";

        let outcome = rewriter.rewrite(Oid::from_u64(1), payload).unwrap();
        assert_eq!(
            outcome,
            Outcome::Rewritten(b"\x80\x03cmodule1\nNewFactory\nq\x00.\x80\x03}q\x01.".to_vec())
        );
        assert_eq!(rewriter.implicit_rules().len(), 1);
    }

    #[test]
    fn canonical_record_is_unchanged() {
        let mut rewriter = rewriter(SymbolResolver::new(catalog()));
        let payload = b"\x80\x03cmodule2\nOtherFactory\nq\x00.\x80\x03}q\x01.";
        assert_eq!(
            rewriter.rewrite(Oid::from_u64(1), payload).unwrap(),
            Outcome::Unchanged
        );
    }

    #[test]
    fn repickle_all_rewrites_unchanged_records() {
        let config = RunConfig::new().with_repickle_all(true).with_protocol(Protocol::V2);
        let mut rewriter =
            RecordRewriter::new(SymbolResolver::new(OpenRegistry), DecoderRegistry::new(), &config);
        let payload = b"\x80\x03cmodule2\nOtherFactory\nq\x00.\x80\x03}q\x01.";
        assert_eq!(
            rewriter.rewrite(Oid::from_u64(1), payload).unwrap(),
            Outcome::Rewritten(b"\x80\x02cmodule2\nOtherFactory\nq\x00.\x80\x02}q\x01.".to_vec())
        );
    }

    #[test]
    fn skipped_class_stops_before_state() {
        let skip = SkipSet::default().with(d("module1 Factory"));
        let rules = RenameRules::new().with(d("module1 Factory"), d("module2 OtherFactory"));
        let mut rewriter = rewriter(SymbolResolver::new(catalog()).with_rules(rules).with_skip(skip));
        // state pickle is garbage: it must never be read
        let payload = b"\x80\x03cmodule1\nFactory\nq\x00.\xff\xff";
        assert_eq!(
            rewriter.rewrite(Oid::from_u64(1), payload).unwrap(),
            Outcome::Skipped
        );
    }

    #[test]
    fn skipped_global_in_constructor_args_skips_record() {
        let skip = SkipSet::default().with(d("module2 OtherFactory"));
        let mut rewriter = rewriter(SymbolResolver::new(catalog()).with_skip(skip));
        // (NewFactory, (OtherFactory,)) followed by an unreadable state
        let payload = b"\x80\x03cmodule1\nNewFactory\nq\x00cmodule2\nOtherFactory\nq\x01\x85q\x02\x86q\x03.\xff\xff";
        assert_eq!(
            rewriter.rewrite(Oid::from_u64(1), payload).unwrap(),
            Outcome::Skipped
        );
        assert!(rewriter.implicit_rules().is_empty());
    }

    #[test]
    fn pair_class_metadata_is_renamed() {
        let rules = RenameRules::new().with(d("module1 Factory"), d("module2 OtherFactory"));
        let mut rewriter = rewriter(SymbolResolver::new(catalog()).with_rules(rules));
        let payload = b"\x80\x03X\x07\x00\x00\x00module1q\x00X\x07\x00\x00\x00Factoryq\x01\x86q\x02N\x86q\x03.\x80\x03}q\x04.";

        let Outcome::Rewritten(bytes) = rewriter.rewrite(Oid::from_u64(1), payload).unwrap() else {
            panic!("expected rewrite");
        };
        let (values, _) = rebind_pickle::load_all(&bytes).unwrap();
        assert_eq!(
            values[0],
            Value::Tuple(vec![
                Value::Tuple(vec![Value::str("module2"), Value::str("OtherFactory")]),
                Value::None,
            ])
        );
    }

    #[test]
    fn missing_reference_class_is_kept_and_warned() {
        let mut catalog = catalog();
        catalog.remove_module("module2");
        let mut rewriter = rewriter(SymbolResolver::new(catalog));
        let payload: &[u8] = b"\x80\x03cmodule1\nNewFactory\nq\x00.\x80\x03}q\x01X\x05\x00\x00\x00otherq\x02C\x08\x00\x00\x00\x00\x00\x00\x00\x02q\x03cmodule2\nOtherFactory\nq\x04\x86q\x05Qs.";

        assert_eq!(rewriter.rewrite(Oid::from_u64(1), payload).unwrap(), Outcome::Unchanged);
        assert_eq!(
            rewriter.warnings().messages().collect::<Vec<_>>(),
            vec!["Missing factory for module2 OtherFactory"]
        );
        assert!(rewriter.broken_types().get("module2.OtherFactory").is_some());
    }

    #[test]
    fn broken_reference_survives_repickle() {
        let mut catalog = catalog();
        catalog.remove_module("module2");
        let config = RunConfig::new().with_repickle_all(true);
        let mut rewriter =
            RecordRewriter::new(SymbolResolver::new(catalog), DecoderRegistry::new(), &config);
        let payload: &[u8] = b"\x80\x03cmodule1\nNewFactory\nq\x00.\x80\x03}q\x01X\x05\x00\x00\x00otherq\x02C\x08\x00\x00\x00\x00\x00\x00\x00\x02q\x03cmodule2\nOtherFactory\nq\x04\x86q\x05Qs.";

        assert_eq!(
            rewriter.rewrite(Oid::from_u64(1), payload).unwrap(),
            Outcome::Rewritten(payload.to_vec())
        );
    }

    #[test]
    fn decoder_change_alone_rewrites() {
        let decoders = DecoderRegistry::new()
            .with(d("module2 OtherFactory"), EncodeBinary::new("binary"))
            .with(d("module2 OtherFactory"), DecodeAttribute::new("text", TextEncoding::Utf8));
        let mut rewriter =
            RecordRewriter::new(SymbolResolver::new(catalog()), decoders, &RunConfig::new());
        let payload: &[u8] = b"\x80\x02cmodule2\nOtherFactory\nq\x00.\x80\x02}q\x01(U\x06binaryq\x02U\x03abcq\x03U\x04textq\x04U\x02\xc3\xa9q\x05u.";

        let Outcome::Rewritten(bytes) = rewriter.rewrite(Oid::from_u64(1), payload).unwrap() else {
            panic!("expected rewrite");
        };
        assert_eq!(
            bytes,
            b"\x80\x03cmodule2\nOtherFactory\nq\x00.\x80\x03}q\x01(U\x06binaryq\x02C\x03abcq\x03U\x04textq\x04X\x02\x00\x00\x00\xc3\xa9q\x05u."
                .to_vec()
        );
    }

    #[test]
    fn unknown_reference_shape_is_fatal() {
        let mut rewriter = rewriter(SymbolResolver::new(catalog()));
        // persistent id is an integer
        let payload = b"\x80\x03cmodule2\nOtherFactory\nq\x00.\x80\x03K\x05Q.";
        let err = rewriter.rewrite(Oid::from_u64(1), payload).unwrap_err();
        assert!(matches!(err, MigrationError::UnknownReferenceShape(_)));
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let mut rewriter = rewriter(SymbolResolver::new(catalog()));
        let err = rewriter
            .rewrite(Oid::from_u64(7), b"\x80\x03cmodule2\nOtherFactory\nq\x00.\x80\x03}")
            .unwrap_err();
        assert!(matches!(err, MigrationError::Malformed { .. }));
    }

    #[test]
    fn irreproducible_global_fails_serialization() {
        let rules = RenameRules::new().with(d("module1 Factory"), ClassDescriptor::new("bad\nmodule", "Factory"));
        let mut rewriter = rewriter(SymbolResolver::new(catalog()).with_rules(rules));
        let payload = b"\x80\x03cmodule1\nFactory\nq\x00.\x80\x03}q\x01.";
        assert_eq!(
            rewriter.rewrite(Oid::from_u64(1), payload).unwrap(),
            Outcome::SerializeFailed
        );
    }
}
