//! Structured payloads exchanged with search servers.
//!
//! Every record is a fixed sequence of codec primitives; decoding consumes
//! fields in exactly the order listed on the encode side. Count fields are
//! validated against the documented maxima before any element is read.

use std::collections::BTreeMap;

use crate::codec::{WireReader, WireWriter};
use crate::Result;

pub const MAX_FILTERS: usize = 64;
pub const MAX_FILTER_NAME: usize = 128;
pub const MAX_DEPENDENCIES: usize = 64;
pub const MAX_ARGUMENTS: usize = 256;
pub const MAX_ATTRIBUTES: usize = 1024;
pub const MAX_SESSION_VARIABLES: usize = 1024;
pub const MAX_LABELS: usize = 1024;

fn encode_string_list(w: &mut WireWriter, items: &[String]) {
    w.write_u32(items.len() as u32);
    for item in items {
        w.write_string(item);
    }
}

fn decode_string_list(r: &mut WireReader<'_>, max: usize, what: &str) -> Result<Vec<String>> {
    let count = r.read_count(max, what)?;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(r.read_string()?);
    }
    Ok(items)
}

/// Per-filter configuration sent with `SET_FILTERS`.
///
/// Field order: name, dependency list, code signature, blob signature,
/// min score, max score, argument list.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterSpec {
    pub name: String,
    pub dependencies: Vec<String>,
    pub code_signature: String,
    pub blob_signature: String,
    pub min_score: f64,
    pub max_score: f64,
    pub arguments: Vec<String>,
}

impl FilterSpec {
    pub fn encode_to(&self, w: &mut WireWriter) {
        w.write_string(&self.name);
        encode_string_list(w, &self.dependencies);
        w.write_string(&self.code_signature);
        w.write_string(&self.blob_signature);
        w.write_f64(self.min_score);
        w.write_f64(self.max_score);
        encode_string_list(w, &self.arguments);
    }

    pub fn decode_from(r: &mut WireReader<'_>) -> Result<Self> {
        let name = r.read_string()?;
        if name.len() > MAX_FILTER_NAME {
            return Err(crate::WireError::Malformed(format!(
                "filter name of {} bytes exceeds maximum {MAX_FILTER_NAME}",
                name.len()
            )));
        }
        Ok(Self {
            name,
            dependencies: decode_string_list(r, MAX_DEPENDENCIES, "filter dependency")?,
            code_signature: r.read_string()?,
            blob_signature: r.read_string()?,
            min_score: r.read_f64()?,
            max_score: r.read_f64()?,
            arguments: decode_string_list(r, MAX_ARGUMENTS, "filter argument")?,
        })
    }
}

/// The complete `SET_FILTERS` payload: every filter that will run on the
/// device, dependencies first on the server side.
pub fn encode_filter_specs(specs: &[FilterSpec]) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.write_u32(specs.len() as u32);
    for spec in specs {
        spec.encode_to(&mut w);
    }
    w.into_vec()
}

pub fn decode_filter_specs(payload: &[u8]) -> Result<Vec<FilterSpec>> {
    let mut r = WireReader::new(payload);
    let count = r.read_count(MAX_FILTERS, "filter")?;
    let mut specs = Vec::with_capacity(count);
    for _ in 0..count {
        specs.push(FilterSpec::decode_from(&mut r)?);
    }
    Ok(specs)
}

/// `SET_PUSH_ATTRIBUTES` payload: the attribute names the server should
/// include with every pushed object.
pub fn encode_attribute_names(names: &[String]) -> Vec<u8> {
    let mut w = WireWriter::new();
    encode_string_list(&mut w, names);
    w.into_vec()
}

pub fn decode_attribute_names(payload: &[u8]) -> Result<Vec<String>> {
    let mut r = WireReader::new(payload);
    decode_string_list(&mut r, MAX_ATTRIBUTES, "push attribute")
}

/// Host-scoped session variables: name → value.
///
/// A `BTreeMap` keeps the wire order deterministic, which keeps the
/// cross-host merge fold reproducible for a given host iteration order.
pub type SessionVariables = BTreeMap<String, f64>;

pub fn encode_session_variables(vars: &SessionVariables) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.write_u32(vars.len() as u32);
    for (name, value) in vars {
        w.write_string(name);
        w.write_f64(*value);
    }
    w.into_vec()
}

pub fn decode_session_variables(payload: &[u8]) -> Result<SessionVariables> {
    let mut r = WireReader::new(payload);
    let count = r.read_count(MAX_SESSION_VARIABLES, "session variable")?;
    let mut vars = SessionVariables::new();
    for _ in 0..count {
        let name = r.read_string()?;
        let value = r.read_f64()?;
        vars.insert(name, value);
    }
    Ok(vars)
}

/// Per-filter execution counters inside a stats reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterStatistics {
    pub name: String,
    pub objects_processed: u64,
    pub objects_dropped: u64,
    pub avg_exec_time_ns: u64,
}

/// One host's accumulated view from a `REQUEST_STATS` reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerStatistics {
    pub objects_total: u64,
    pub objects_processed: u64,
    pub objects_dropped: u64,
    pub filters: Vec<FilterStatistics>,
}

impl ServerStatistics {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.write_u64(self.objects_total);
        w.write_u64(self.objects_processed);
        w.write_u64(self.objects_dropped);
        w.write_u32(self.filters.len() as u32);
        for f in &self.filters {
            w.write_string(&f.name);
            w.write_u64(f.objects_processed);
            w.write_u64(f.objects_dropped);
            w.write_u64(f.avg_exec_time_ns);
        }
        w.into_vec()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(payload);
        let objects_total = r.read_u64()?;
        let objects_processed = r.read_u64()?;
        let objects_dropped = r.read_u64()?;
        let count = r.read_count(MAX_FILTERS, "filter statistics")?;
        let mut filters = Vec::with_capacity(count);
        for _ in 0..count {
            filters.push(FilterStatistics {
                name: r.read_string()?,
                objects_processed: r.read_u64()?,
                objects_dropped: r.read_u64()?,
                avg_exec_time_ns: r.read_u64()?,
            });
        }
        Ok(Self {
            objects_total,
            objects_processed,
            objects_dropped,
            filters,
        })
    }
}

/// `START_SEARCH` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchStart {
    pub search_id: u32,
    pub push_attributes: Vec<String>,
}

impl SearchStart {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.write_u32(self.search_id);
        encode_string_list(&mut w, &self.push_attributes);
        w.into_vec()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(payload);
        Ok(Self {
            search_id: r.read_u32()?,
            push_attributes: decode_string_list(&mut r, MAX_ATTRIBUTES, "push attribute")?,
        })
    }
}

/// `STOP_SEARCH` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchStop {
    pub search_id: u32,
}

impl SearchStop {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.write_u32(self.search_id);
        w.into_vec()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(payload);
        Ok(Self {
            search_id: r.read_u32()?,
        })
    }
}

/// Identifies one result object well enough to ask its origin host to
/// re-evaluate it later (`REEXECUTE_OBJECT`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectIdentifier {
    pub object_id: String,
    pub device_name: String,
    pub host: String,
}

impl ObjectIdentifier {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.write_string(&self.object_id);
        w.write_string(&self.device_name);
        w.write_string(&self.host);
        w.into_vec()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(payload);
        Ok(Self {
            object_id: r.read_string()?,
            device_name: r.read_string()?,
            host: r.read_string()?,
        })
    }
}

/// One labeled example inside a retraining batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLabel {
    pub object_id: String,
    pub label: i32,
}

/// A batch of labeled examples for retraining one filter.
///
/// Field order: filter name, `u32` label count, then `(object id, label)`
/// per entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelBatch {
    pub filter_name: String,
    pub labels: Vec<ObjectLabel>,
}

impl LabelBatch {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.write_string(&self.filter_name);
        w.write_u32(self.labels.len() as u32);
        for entry in &self.labels {
            w.write_string(&entry.object_id);
            w.write_i32(entry.label);
        }
        w.into_vec()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(payload);
        let filter_name = r.read_string()?;
        let count = r.read_count(MAX_LABELS, "label")?;
        let mut labels = Vec::with_capacity(count);
        for _ in 0..count {
            labels.push(ObjectLabel {
                object_id: r.read_string()?,
                label: r.read_i32()?,
            });
        }
        Ok(Self {
            filter_name,
            labels,
        })
    }
}

/// Attribute map carried by a pushed object: name → raw value bytes.
pub type Attributes = BTreeMap<String, Vec<u8>>;

/// One object pushed over the data channel.
///
/// A push with no attributes **and** a zero-length payload is the
/// per-connection end-of-stream marker, never delivered as a result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlastObject {
    pub attributes: Attributes,
    pub payload: Vec<u8>,
}

impl BlastObject {
    pub fn end_of_stream() -> Self {
        Self::default()
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.attributes.is_empty() && self.payload.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.write_u32(self.attributes.len() as u32);
        for (name, value) in &self.attributes {
            w.write_string(name);
            w.write_opaque(value);
        }
        w.write_opaque(&self.payload);
        w.into_vec()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(payload);
        let count = r.read_count(MAX_ATTRIBUTES, "object attribute")?;
        let mut attributes = Attributes::new();
        for _ in 0..count {
            let name = r.read_string()?;
            let value = r.read_opaque()?;
            attributes.insert(name, value);
        }
        Ok(Self {
            attributes,
            payload: r.read_opaque()?,
        })
    }
}

/// `GET_CHARACTERISTICS` reply payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCharacteristics {
    pub device_name: String,
    pub protocol_revision: u32,
    pub cpu_count: u32,
}

impl DeviceCharacteristics {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.write_string(&self.device_name);
        w.write_u32(self.protocol_revision);
        w.write_u32(self.cpu_count);
        w.into_vec()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(payload);
        Ok(Self {
            device_name: r.read_string()?,
            protocol_revision: r.read_u32()?,
            cpu_count: r.read_u32()?,
        })
    }
}

/// `SET_BLOBS` payload: filter code and blob arguments keyed by the owning
/// filter's name. Sent after `SET_FILTERS` so a server whose filter cache
/// missed has the bytes it needs.
pub fn encode_filter_blobs(blobs: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.write_u32(blobs.len() as u32);
    for (name, blob) in blobs {
        w.write_string(name);
        w.write_opaque(blob);
    }
    w.into_vec()
}

pub fn decode_filter_blobs(payload: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    let mut r = WireReader::new(payload);
    let count = r.read_count(MAX_FILTERS * 2, "filter blob")?;
    let mut blobs = Vec::with_capacity(count);
    for _ in 0..count {
        let name = r.read_string()?;
        let blob = r.read_opaque()?;
        blobs.push((name, blob));
    }
    Ok(blobs)
}

/// Flow-control acknowledgment payload: the number of further pushes the
/// server may send.
pub fn encode_credit(credits: u32) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.write_u32(credits);
    w.into_vec()
}

pub fn decode_credit(payload: &[u8]) -> Result<u32> {
    let mut r = WireReader::new(payload);
    r.read_u32()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec(name: &str) -> FilterSpec {
        FilterSpec {
            name: name.to_string(),
            dependencies: vec!["rgb".to_string(), "thumbnail".to_string()],
            code_signature: "8b1a9953c4611296a827abf8c47804d7".to_string(),
            blob_signature: String::new(),
            min_score: 0.5,
            max_score: f64::INFINITY,
            arguments: vec!["32".to_string(), "grayscale".to_string()],
        }
    }

    #[test]
    fn filter_specs_round_trip() {
        let specs = vec![sample_spec("edges"), sample_spec("faces")];
        let encoded = encode_filter_specs(&specs);
        assert_eq!(decode_filter_specs(&encoded).unwrap(), specs);
    }

    #[test]
    fn too_many_filters_is_malformed() {
        let mut w = WireWriter::new();
        w.write_u32(MAX_FILTERS as u32 + 1);
        assert!(decode_filter_specs(&w.into_vec()).is_err());
    }

    #[test]
    fn overlong_filter_name_is_malformed() {
        let mut spec = sample_spec("x");
        spec.name = "n".repeat(MAX_FILTER_NAME + 1);
        let encoded = encode_filter_specs(&[spec]);
        assert!(decode_filter_specs(&encoded).is_err());
    }

    #[test]
    fn session_variables_round_trip() {
        let mut vars = SessionVariables::new();
        vars.insert("positives".to_string(), 12.0);
        vars.insert("threshold".to_string(), -0.25);
        let encoded = encode_session_variables(&vars);
        assert_eq!(decode_session_variables(&encoded).unwrap(), vars);
    }

    #[test]
    fn statistics_round_trip() {
        let stats = ServerStatistics {
            objects_total: 10_000,
            objects_processed: 9_000,
            objects_dropped: 8_500,
            filters: vec![FilterStatistics {
                name: "edges".to_string(),
                objects_processed: 9_000,
                objects_dropped: 8_000,
                avg_exec_time_ns: 1_250_000,
            }],
        };
        assert_eq!(
            ServerStatistics::decode(&stats.encode()).unwrap(),
            stats
        );
    }

    #[test]
    fn search_records_round_trip() {
        let start = SearchStart {
            search_id: 7,
            push_attributes: vec!["thumbnail".to_string()],
        };
        assert_eq!(SearchStart::decode(&start.encode()).unwrap(), start);

        let stop = SearchStop { search_id: 7 };
        assert_eq!(SearchStop::decode(&stop.encode()).unwrap(), stop);
    }

    #[test]
    fn object_identifier_round_trips() {
        let id = ObjectIdentifier {
            object_id: "sha1:0beec7b5ea3f0fdbc95d0dd47f3c5bc275da8a33".to_string(),
            device_name: "shard-3".to_string(),
            host: "svr2.example.org".to_string(),
        };
        assert_eq!(ObjectIdentifier::decode(&id.encode()).unwrap(), id);
    }

    #[test]
    fn label_batch_round_trips() {
        let batch = LabelBatch {
            filter_name: "faces".to_string(),
            labels: vec![
                ObjectLabel {
                    object_id: "obj-1".to_string(),
                    label: 1,
                },
                ObjectLabel {
                    object_id: "obj-2".to_string(),
                    label: -1,
                },
            ],
        };
        assert_eq!(LabelBatch::decode(&batch.encode()).unwrap(), batch);
    }

    #[test]
    fn too_many_labels_is_malformed() {
        let mut w = WireWriter::new();
        w.write_string("faces");
        w.write_u32(MAX_LABELS as u32 + 1);
        assert!(LabelBatch::decode(&w.into_vec()).is_err());
    }

    #[test]
    fn blast_object_round_trips() {
        let mut attributes = Attributes::new();
        attributes.insert("score".to_string(), vec![0, 0, 0, 9]);
        attributes.insert("name".to_string(), b"img-0042.jpg".to_vec());
        let obj = BlastObject {
            attributes,
            payload: vec![0xde, 0xad, 0xbe, 0xef, 0x01],
        };
        assert!(!obj.is_end_of_stream());
        assert_eq!(BlastObject::decode(&obj.encode()).unwrap(), obj);
    }

    #[test]
    fn empty_push_is_end_of_stream() {
        let eos = BlastObject::end_of_stream();
        assert!(eos.is_end_of_stream());
        let decoded = BlastObject::decode(&eos.encode()).unwrap();
        assert!(decoded.is_end_of_stream());

        // Either a payload or an attribute disqualifies the marker.
        let mut with_payload = BlastObject::end_of_stream();
        with_payload.payload = vec![1];
        assert!(!with_payload.is_end_of_stream());

        let mut with_attr = BlastObject::end_of_stream();
        with_attr.attributes.insert("a".to_string(), Vec::new());
        assert!(!with_attr.is_end_of_stream());
    }

    #[test]
    fn credit_round_trips() {
        assert_eq!(decode_credit(&encode_credit(1)).unwrap(), 1);
    }

    #[test]
    fn characteristics_round_trip() {
        let chars = DeviceCharacteristics {
            device_name: "shard-0".to_string(),
            protocol_revision: 1,
            cpu_count: 16,
        };
        assert_eq!(
            DeviceCharacteristics::decode(&chars.encode()).unwrap(),
            chars
        );
    }

    #[test]
    fn filter_blobs_round_trip() {
        let blobs = vec![
            ("edges".to_string(), vec![1u8, 2, 3]),
            ("faces".to_string(), Vec::new()),
        ];
        assert_eq!(
            decode_filter_blobs(&encode_filter_blobs(&blobs)).unwrap(),
            blobs
        );
    }
}
