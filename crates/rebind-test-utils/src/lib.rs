//! Testing utilities for the rebind workspace
//!
//! Shared fixtures: the `module1`/`module2` type catalog, record builders
//! and populated stores.

#![allow(missing_docs)]

use rebind_core::{DecoderRegistry, MigrationDriver, MigrationReport, RecordRewriter, RunConfig};
use rebind_pickle::{dump_all, Construct, Global, Heap, Instance, Object, Protocol, Value};
use rebind_store::{MemoryStore, Oid, Storage, TransactionMeta};
use rebind_symbol::{ClassDescriptor, RenameRules, SkipSet, SymbolResolver, TypeCatalog};

pub fn d(text: &str) -> ClassDescriptor {
    text.parse().unwrap()
}

pub fn oid(n: u64) -> Oid {
    Oid::from_u64(n)
}

/// Types defined by the `module1` and `module2` test modules
pub fn catalog() -> TypeCatalog {
    let mut catalog = TypeCatalog::new();
    catalog
        .define(d("module1 Factory"))
        .define(d("module1 Data"))
        .define(d("module1 OldData"))
        .define(d("module1 AnonymousFactory"))
        .anonymous(d("module1 Anonymous"))
        .define(d("module1.interfaces IFactory"))
        .define(d("module2 OtherFactory"))
        .define(d("module2.interfaces IOtherFactory"))
        .define(d("zope.interface.declarations Provides"))
        .define(d("datetime datetime"))
        .define(d("datetime date"))
        .define(d("datetime time"));
    catalog
}

/// Catalog after `module1 Factory` was renamed to `module1 NewFactory`,
/// keeping the old name importable
pub fn renamed_catalog() -> TypeCatalog {
    let mut catalog = catalog();
    catalog
        .define(d("module1 NewFactory"))
        .alias(d("module1 Factory"), d("module1 NewFactory"));
    catalog
}

pub fn rules(pairs: &[(&str, &str)]) -> RenameRules {
    pairs.iter().map(|(from, to)| (d(from), d(to))).collect()
}

/// Encode a two-pickle record
#[derive(Debug)]
pub struct RecordBuilder {
    protocol: Protocol,
    legacy: bool,
    heap: Heap,
    class: Global,
    state: Vec<(Value, Value)>,
}

impl RecordBuilder {
    /// Record written by a Python 3 host
    pub fn new(module: &str, name: &str) -> Self {
        Self {
            protocol: Protocol::V3,
            legacy: false,
            heap: Heap::new(),
            class: Global::new(module, name),
            state: Vec::new(),
        }
    }

    /// Record written by a Python 2 host: protocol 2, legacy string keys
    /// and object ids
    pub fn legacy(module: &str, name: &str) -> Self {
        Self {
            protocol: Protocol::V2,
            legacy: true,
            ..Self::new(module, name)
        }
    }

    pub fn class(&self) -> Value {
        Value::Global(self.class.clone())
    }

    fn key(&self, key: &str) -> Value {
        self.text(key)
    }

    /// Native string: legacy in Python 2 records
    pub fn text(&self, text: &str) -> Value {
        if self.legacy {
            Value::LegacyString(text.as_bytes().to_vec())
        } else {
            Value::str(text)
        }
    }

    fn oid_value(&self, oid: u64) -> Value {
        let bytes = oid.to_be_bytes().to_vec();
        if self.legacy {
            Value::LegacyString(bytes)
        } else {
            Value::Bytes(bytes)
        }
    }

    pub fn attr(mut self, key: &str, value: Value) -> Self {
        let key = self.key(key);
        self.state.push((key, value));
        self
    }

    /// Persistent reference `(oid, class)`
    pub fn reference(self, key: &str, oid: u64, module: &str, name: &str) -> Self {
        let pid = Value::Tuple(vec![
            self.oid_value(oid),
            Value::Global(Global::new(module, name)),
        ]);
        self.attr(key, Value::Persistent(Box::new(pid)))
    }

    /// Weak reference `[oid]`
    pub fn weak_reference(mut self, key: &str, oid: u64) -> Self {
        let oid = self.oid_value(oid);
        let pid = Value::Ref(self.heap.alloc(Object::List(vec![oid])));
        self.attr(key, Value::Persistent(Box::new(pid)))
    }

    /// Plain object built through `NEWOBJ` with an empty state dict
    pub fn object(mut self, key: &str, module: &str, name: &str) -> Self {
        let state = Value::Ref(self.heap.alloc(Object::Dict(Vec::new())));
        let mut instance = Instance::new(Construct::NewObj {
            class: Value::Global(Global::new(module, name)),
            args: Value::Tuple(Vec::new()),
        });
        instance.state.push(state);
        let value = Value::Ref(self.heap.alloc(Object::Instance(instance)));
        self.attr(key, value)
    }

    /// Classic instance built through `OBJ` with an empty state dict
    pub fn old_style_object(mut self, key: &str, module: &str, name: &str) -> Self {
        let state = Value::Ref(self.heap.alloc(Object::Dict(Vec::new())));
        let mut instance = Instance::new(Construct::Inst {
            class: Value::Global(Global::new(module, name)),
            args: Vec::new(),
        });
        instance.state.push(state);
        let value = Value::Ref(self.heap.alloc(Object::Instance(instance)));
        self.attr(key, value)
    }

    /// `callable(*args)` attribute
    pub fn reduce(mut self, key: &str, module: &str, name: &str, args: Vec<Value>) -> Self {
        let instance = Instance::new(Construct::Reduce {
            callable: Value::Global(Global::new(module, name)),
            args: Value::Tuple(args),
        });
        let value = Value::Ref(self.heap.alloc(Object::Instance(instance)));
        self.attr(key, value)
    }

    /// `__provides__` declaration of `interface`
    pub fn provides(self, module: &str, name: &str) -> Self {
        let args = vec![self.class(), Value::Global(Global::new(module, name))];
        self.reduce(
            "__provides__",
            "zope.interface.declarations",
            "Provides",
            args,
        )
    }

    pub fn build(mut self) -> Vec<u8> {
        let dict = Value::Ref(self.heap.alloc(Object::Dict(std::mem::take(&mut self.state))));
        dump_all(&[self.class(), dict], &self.heap, self.protocol).unwrap()
    }
}

/// Store holding `records` in one committed transaction
pub fn store_with(records: Vec<(u64, Vec<u8>)>) -> MemoryStore {
    let store = MemoryStore::new().named("fixture");
    store
        .commit_records(
            TransactionMeta::new(),
            records.into_iter().map(|(n, data)| (oid(n), data)),
        )
        .unwrap();
    store
}

pub fn payload(store: &dyn Storage, n: u64) -> Vec<u8> {
    store.load(oid(n)).unwrap().0
}

/// Migration inputs with test defaults
pub struct Migration {
    pub catalog: TypeCatalog,
    pub rules: RenameRules,
    pub skip: SkipSet,
    pub decoders: DecoderRegistry,
    pub config: RunConfig,
}

impl Default for Migration {
    fn default() -> Self {
        Self {
            catalog: catalog(),
            rules: RenameRules::new(),
            skip: SkipSet::default(),
            decoders: DecoderRegistry::new(),
            config: RunConfig::new(),
        }
    }
}

impl Migration {
    pub fn rewriter(self) -> (RecordRewriter, RunConfig) {
        let resolver = SymbolResolver::new(self.catalog)
            .with_rules(self.rules)
            .with_skip(self.skip);
        (
            RecordRewriter::new(resolver, self.decoders, &self.config),
            self.config,
        )
    }

    /// Run over `store`, returning the report and the rewriter state
    pub fn run(self, store: &dyn Storage) -> (MigrationReport, RecordRewriter) {
        let (rewriter, config) = self.rewriter();
        let mut driver = MigrationDriver::new(store, rewriter, config);
        let report = driver.run().unwrap();
        (report, driver.into_rewriter())
    }
}
