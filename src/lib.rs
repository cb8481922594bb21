//! Compact, self-describing binary object-graph codec.
//!
//! `tagwire` moves typed value graphs — primitives, strings, dates, byte
//! blobs, homogeneous vectors, dictionaries, and class-shaped objects —
//! between a producer and a consumer without a schema compiler step.
//! Every value starts with a one-byte type marker; integers use a 29-bit
//! variable-length encoding; strings, complex values, and class shapes
//! ("traits") deduplicate through three per-stream reference tables, so
//! repeated values and shared subgraphs encode as positional
//! back-references and cyclic graphs round-trip.
//!
//! # Layout
//!
//! ```text
//! value      := marker:u8 payload
//! integer    := U29 (29-bit varint, 7+7+7+8 packing)
//! string     := (len << 1) | 1, utf8   |   (index << 1)
//! complex    := (count << 1) | 1, ...  |   (index << 1)
//! object     := flags:U29 [trait] [properties] [dynamic pairs, "" end]
//! ```
//!
//! # Entry points
//!
//! [`encode`] / [`decode`] are the one-shot calls. [`Writer`] and
//! [`Reader`] expose the streaming surface, the custom-serializer SPI
//! ([`Externalizer`]), and the field-order read API backed by the
//! property remap engine (see [`remap`]).
//!
//! A `Writer`/`Reader` and its tables belong to one thread; the one
//! piece of shared state is the [`SerializerRegistry`], which is safe to
//! resolve from any thread concurrently with registration.

pub mod error;
pub mod marker;
pub mod varint;

pub mod refs;
pub mod registry;
pub mod remap;
pub mod trait_def;
pub mod value;

pub mod reader;
pub mod writer;

// ── Entry points ─────────────────────────────────────────────────────────────
pub use reader::{decode, Reader, ReaderOptions};
pub use writer::{encode, Writer, WriterOptions};

// ── Value model ──────────────────────────────────────────────────────────────
pub use value::{
    Array, Complex, Date, Dictionary, ObjRef, ObjectValue, ObjectVector, TypedVector, Variant,
};

// ── Class shapes and serializers ─────────────────────────────────────────────
pub use registry::{
    ClassDescriptor, Externalizer, FieldSource, Serializer, SerializerRegistry,
};
pub use trait_def::TraitDef;

// ── Remap engine ─────────────────────────────────────────────────────────────
pub use remap::{FieldLayout, RemapTable, REMAP_ABSENT};

// ── Errors ───────────────────────────────────────────────────────────────────
pub use error::{CodecError, Result};
