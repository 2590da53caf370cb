//! Polymorphic value objects
//!
//! Every value in the keyspace is an `Arc<Object>`: the strong count is
//! the refcount, the interned shared-integer table stands in for the
//! "never freed" sentinel, and `Arc::make_mut` is the unshare step every
//! write path goes through before mutating. The body is a sum type whose
//! variant pair (logical type, physical encoding) only ever moves from a
//! compact encoding to a general one.

use crate::dict::Dict;
use crate::packed::PackedList;
use crate::quicklist::Quicklist;
use crate::util::parse_i64;
use std::borrow::Cow;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Longest string stored inline in the embedded encoding.
pub const EMBED_MAX: usize = 44;

/// Interned integer objects 0..SHARED_INTEGERS are handed out instead of
/// fresh allocations.
pub const SHARED_INTEGERS: i64 = 10000;

pub type Value = Arc<Object>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    String,
    List,
    Hash,
    Set,
    ZSet,
    Stream,
}

impl ObjectType {
    pub fn name(&self) -> &'static str {
        match self {
            ObjectType::String => "string",
            ObjectType::List => "list",
            ObjectType::Hash => "hash",
            ObjectType::Set => "set",
            ObjectType::ZSet => "zset",
            ObjectType::Stream => "stream",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Int,
    Embstr,
    Raw,
    Packed,
    Quicklist,
    HashTable,
}

impl Encoding {
    pub fn name(&self) -> &'static str {
        match self {
            Encoding::Int => "int",
            Encoding::Embstr => "embstr",
            Encoding::Raw => "raw",
            Encoding::Packed => "packed",
            Encoding::Quicklist => "quicklist",
            Encoding::HashTable => "hashtable",
        }
    }
}

#[derive(Debug, Clone)]
pub enum StrRep {
    /// Decimal integer round-trippable to the original bytes.
    Int(i64),
    /// Short string held inline.
    Embed { len: u8, data: [u8; EMBED_MAX] },
    Raw(Vec<u8>),
}

#[derive(Debug, Clone)]
pub enum HashRep {
    /// Alternating field/value entries in one packed list.
    Packed(PackedList),
    Table(Dict<Vec<u8>>),
}

#[derive(Debug, Clone)]
pub enum ObjectBody {
    Str(StrRep),
    List(Quicklist),
    Hash(HashRep),
}

#[derive(Debug)]
pub struct Object {
    /// Access recency stamp (server lru clock seconds), updated on reads
    /// unless the caller asked not to touch it.
    lru: AtomicU32,
    body: ObjectBody,
}

impl Clone for Object {
    fn clone(&self) -> Self {
        Object {
            lru: AtomicU32::new(self.lru.load(Ordering::Relaxed)),
            body: self.body.clone(),
        }
    }
}

impl Object {
    // ---- constructors ----

    /// Build a string object, applying the compact encodings: integer tag
    /// for round-trippable decimals, inline buffer for short strings.
    pub fn string_from(data: &[u8]) -> Object {
        let rep = match parse_i64(data) {
            Some(v) => StrRep::Int(v),
            None if data.len() <= EMBED_MAX => {
                let mut buf = [0u8; EMBED_MAX];
                buf[..data.len()].copy_from_slice(data);
                StrRep::Embed { len: data.len() as u8, data: buf }
            }
            None => StrRep::Raw(data.to_vec()),
        };
        Object { lru: AtomicU32::new(0), body: ObjectBody::Str(rep) }
    }

    /// Build a raw string object without encoding attempts (append and
    /// range writes land here).
    pub fn raw_string(data: Vec<u8>) -> Object {
        Object { lru: AtomicU32::new(0), body: ObjectBody::Str(StrRep::Raw(data)) }
    }

    pub fn from_int(v: i64) -> Object {
        Object { lru: AtomicU32::new(0), body: ObjectBody::Str(StrRep::Int(v)) }
    }

    pub fn list(fill: i32, compress_depth: u32) -> Object {
        Object {
            lru: AtomicU32::new(0),
            body: ObjectBody::List(Quicklist::new(fill, compress_depth)),
        }
    }

    pub fn hash() -> Object {
        Object {
            lru: AtomicU32::new(0),
            body: ObjectBody::Hash(HashRep::Packed(PackedList::new())),
        }
    }

    // ---- introspection ----

    pub fn object_type(&self) -> ObjectType {
        match &self.body {
            ObjectBody::Str(_) => ObjectType::String,
            ObjectBody::List(_) => ObjectType::List,
            ObjectBody::Hash(_) => ObjectType::Hash,
        }
    }

    pub fn encoding(&self) -> Encoding {
        match &self.body {
            ObjectBody::Str(StrRep::Int(_)) => Encoding::Int,
            ObjectBody::Str(StrRep::Embed { .. }) => Encoding::Embstr,
            ObjectBody::Str(StrRep::Raw(_)) => Encoding::Raw,
            ObjectBody::List(_) => Encoding::Quicklist,
            ObjectBody::Hash(HashRep::Packed(_)) => Encoding::Packed,
            ObjectBody::Hash(HashRep::Table(_)) => Encoding::HashTable,
        }
    }

    pub fn lru(&self) -> u32 {
        self.lru.load(Ordering::Relaxed)
    }

    pub fn touch_lru(&self, clock: u32) {
        self.lru.store(clock, Ordering::Relaxed);
    }

    // ---- string access ----

    /// Raw bytes of a string object regardless of its encoding.
    pub fn string_bytes(&self) -> Cow<'_, [u8]> {
        match &self.body {
            ObjectBody::Str(StrRep::Int(v)) => Cow::Owned(v.to_string().into_bytes()),
            ObjectBody::Str(StrRep::Embed { len, data }) => {
                Cow::Borrowed(&data[..*len as usize])
            }
            ObjectBody::Str(StrRep::Raw(v)) => Cow::Borrowed(v),
            _ => unreachable!("string access on a non-string object"),
        }
    }

    pub fn string_len(&self) -> usize {
        match &self.body {
            ObjectBody::Str(StrRep::Int(v)) => {
                let mut n = if *v < 0 { 1 } else { 0 };
                let mut x = v.unsigned_abs();
                loop {
                    n += 1;
                    x /= 10;
                    if x == 0 {
                        break;
                    }
                }
                n
            }
            ObjectBody::Str(StrRep::Embed { len, .. }) => *len as usize,
            ObjectBody::Str(StrRep::Raw(v)) => v.len(),
            _ => unreachable!("string access on a non-string object"),
        }
    }

    /// Integer view of a string object, when it has one.
    pub fn string_as_int(&self) -> Option<i64> {
        match &self.body {
            ObjectBody::Str(StrRep::Int(v)) => Some(*v),
            ObjectBody::Str(_) => parse_i64(&self.string_bytes()),
            _ => None,
        }
    }

    /// Append bytes, degrading to the raw encoding (one-way). Returns the
    /// new length.
    pub fn string_append(&mut self, extra: &[u8]) -> usize {
        let mut raw = self.string_bytes().into_owned();
        raw.extend_from_slice(extra);
        let len = raw.len();
        self.body = ObjectBody::Str(StrRep::Raw(raw));
        len
    }

    /// Overwrite bytes at `offset`, zero-padding any gap. Returns the new
    /// length.
    pub fn string_setrange(&mut self, offset: usize, data: &[u8]) -> usize {
        let mut raw = self.string_bytes().into_owned();
        if raw.len() < offset + data.len() {
            raw.resize(offset + data.len(), 0);
        }
        raw[offset..offset + data.len()].copy_from_slice(data);
        let len = raw.len();
        self.body = ObjectBody::Str(StrRep::Raw(raw));
        len
    }

    // ---- list access ----

    pub fn list_ref(&self) -> &Quicklist {
        match &self.body {
            ObjectBody::List(ql) => ql,
            _ => unreachable!("list access on a non-list object"),
        }
    }

    pub fn list_mut(&mut self) -> &mut Quicklist {
        match &mut self.body {
            ObjectBody::List(ql) => ql,
            _ => unreachable!("list access on a non-list object"),
        }
    }

    // ---- hash access ----

    pub fn hash_len(&self) -> usize {
        match &self.body {
            ObjectBody::Hash(HashRep::Packed(pl)) => pl.len() / 2,
            ObjectBody::Hash(HashRep::Table(d)) => d.len(),
            _ => unreachable!("hash access on a non-hash object"),
        }
    }

    pub fn hash_get(&self, field: &[u8]) -> Option<Vec<u8>> {
        match &self.body {
            ObjectBody::Hash(HashRep::Packed(pl)) => {
                let start = pl.head_offset()?;
                let at = pl.find(start, field, 1)?;
                let value_at = pl.next_entry(at)?;
                Some(pl.get(value_at).to_vec())
            }
            ObjectBody::Hash(HashRep::Table(d)) => d.find(field).cloned(),
            _ => unreachable!("hash access on a non-hash object"),
        }
    }

    pub fn hash_exists(&self, field: &[u8]) -> bool {
        match &self.body {
            ObjectBody::Hash(HashRep::Packed(pl)) => match pl.head_offset() {
                Some(start) => pl.find(start, field, 1).is_some(),
                None => false,
            },
            ObjectBody::Hash(HashRep::Table(d)) => d.contains(field),
            _ => unreachable!("hash access on a non-hash object"),
        }
    }

    /// Set a field. Returns true when the field was newly created.
    /// Converts packed -> table once the entry count or any field/value
    /// length crosses the configured thresholds; never converts back.
    pub fn hash_set(
        &mut self,
        field: &[u8],
        value: &[u8],
        max_packed_entries: usize,
        max_packed_value: usize,
    ) -> bool {
        if let ObjectBody::Hash(HashRep::Packed(_)) = &self.body {
            // Oversized fields or values force the general encoding up
            // front; the entry-count threshold is checked after the add.
            if field.len() > max_packed_value || value.len() > max_packed_value {
                self.hash_convert_to_table();
            }
        }
        let added = match &mut self.body {
            ObjectBody::Hash(HashRep::Packed(pl)) => {
                let existing = pl
                    .head_offset()
                    .and_then(|start| pl.find(start, field, 1));
                match existing {
                    Some(at) => {
                        let value_at = pl.next_entry(at).expect("dangling hash field");
                        pl.replace(value_at, value);
                        false
                    }
                    None => {
                        pl.push(field, false);
                        pl.push(value, false);
                        true
                    }
                }
            }
            ObjectBody::Hash(HashRep::Table(d)) => d.upsert(field, value.to_vec()).is_none(),
            _ => unreachable!("hash access on a non-hash object"),
        };
        if matches!(&self.body, ObjectBody::Hash(HashRep::Packed(_)))
            && self.hash_len() > max_packed_entries
        {
            self.hash_convert_to_table();
        }
        added
    }

    /// Delete a field. Returns true when it existed.
    pub fn hash_del(&mut self, field: &[u8]) -> bool {
        match &mut self.body {
            ObjectBody::Hash(HashRep::Packed(pl)) => {
                let Some(start) = pl.head_offset() else { return false };
                match pl.find(start, field, 1) {
                    Some(at) => {
                        // Field and its value are adjacent entries.
                        pl.delete(at);
                        pl.delete(at);
                        true
                    }
                    None => false,
                }
            }
            ObjectBody::Hash(HashRep::Table(d)) => d.remove(field).is_some(),
            _ => unreachable!("hash access on a non-hash object"),
        }
    }

    /// All field/value pairs in storage order (packed) or table order.
    pub fn hash_pairs(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        match &self.body {
            ObjectBody::Hash(HashRep::Packed(pl)) => {
                let mut out = Vec::with_capacity(pl.len() / 2);
                let mut it = pl.iter();
                while let (Some(f), Some(v)) = (it.next(), it.next()) {
                    out.push((f.to_vec(), v.to_vec()));
                }
                out
            }
            ObjectBody::Hash(HashRep::Table(d)) => {
                d.iter().map(|(k, v)| (k.to_vec(), v.clone())).collect()
            }
            _ => unreachable!("hash access on a non-hash object"),
        }
    }

    /// Scan cursor over a hash (for HSCAN): packed hashes are returned
    /// whole in one step, tables use the dict scan cursor.
    pub fn hash_scan(&self, cursor: u64, limit: usize) -> (u64, Vec<(Vec<u8>, Vec<u8>)>) {
        match &self.body {
            ObjectBody::Hash(HashRep::Packed(_)) => (0, self.hash_pairs()),
            ObjectBody::Hash(HashRep::Table(d)) => {
                let mut out = Vec::new();
                let mut c = cursor;
                loop {
                    c = d.scan(c, |k, v| out.push((k.to_vec(), v.clone())));
                    if c == 0 || out.len() >= limit {
                        break;
                    }
                }
                (c, out)
            }
            _ => unreachable!("hash access on a non-hash object"),
        }
    }

    fn hash_convert_to_table(&mut self) {
        if let ObjectBody::Hash(HashRep::Packed(pl)) = &self.body {
            let mut d = Dict::new();
            let mut it = pl.iter();
            while let (Some(f), Some(v)) = (it.next(), it.next()) {
                let _ = d.insert(&f.to_vec(), v.to_vec());
            }
            self.body = ObjectBody::Hash(HashRep::Table(d));
        }
    }
}

/// Interned read-only objects shared across the whole server. Handing out
/// clones of these `Arc`s instead of fresh allocations keeps hot small
/// integers from being re-created on every reply.
pub struct SharedObjects {
    integers: Vec<Value>,
}

impl SharedObjects {
    pub fn new() -> Self {
        let integers = (0..SHARED_INTEGERS).map(|v| Arc::new(Object::from_int(v))).collect();
        Self { integers }
    }

    /// Shared object for a small non-negative integer.
    pub fn integer(&self, v: i64) -> Option<Value> {
        if (0..SHARED_INTEGERS).contains(&v) {
            Some(Arc::clone(&self.integers[v as usize]))
        } else {
            None
        }
    }
}

impl Default for SharedObjects {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the value object for a SET-like write: shared integer when
/// possible, otherwise a freshly encoded string.
pub fn encode_string_value(shared: &SharedObjects, data: &[u8]) -> Value {
    if let Some(v) = parse_i64(data) {
        if let Some(obj) = shared.integer(v) {
            return obj;
        }
        return Arc::new(Object::from_int(v));
    }
    Arc::new(Object::string_from(data))
}
