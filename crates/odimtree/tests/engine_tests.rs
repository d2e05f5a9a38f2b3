//! End-to-end tests for the odimtree engine: round-trips through real files,
//! collection invariants, fetch idempotence, lazy preload filtering,
//! append-only updates, compound deduplication, compression and
//! engine-scoped diagnostics.

use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use odimtree_format::datatype::{Datatype, DatatypeByteOrder};

use odimtree::{
    Collection, CompoundTypeDescription, Compression, CreationProperties, Diagnostics, Engine,
    EngineConfig, Error, Fetch, FormatSpecifier, LazyLoader, Mark, Node, NodeKind, Payload,
};

type Summary = Vec<(String, NodeKind, Vec<usize>, Option<FormatSpecifier>, Option<Vec<u8>>)>;

/// Everything observable about a collection after a full fetch.
fn summary(c: &Collection) -> Summary {
    c.iter()
        .map(|n| {
            (
                n.path().to_string(),
                n.kind(),
                n.dims().to_vec(),
                n.format(),
                n.data().map(<[u8]>::to_vec),
            )
        })
        .collect()
}

fn read_everything(engine: &Engine, path: &Path) -> Collection {
    let mut c = engine.read_structure(path, "").unwrap();
    c.select_all();
    engine.fetch_marked(&mut c).unwrap();
    c
}

/// A small polar volume: one scan with two quantities.
fn polar_volume(path: &Path) -> Collection {
    let mut c = Collection::with_filename(path);
    c.add(Node::group("/what").unwrap()).unwrap();
    c.add(Node::string_attribute("/what/object", "PVOL").unwrap()).unwrap();
    c.add(Node::string_attribute("/what/source", "WMO:02954,NOD:fivan").unwrap())
        .unwrap();
    c.add(Node::group("/where").unwrap()).unwrap();
    c.add(Node::scalar_attribute("/where/lat", 61.0444f64).unwrap()).unwrap();
    c.add(Node::scalar_attribute("/where/height", 180i32).unwrap()).unwrap();
    c.add(Node::group("/dataset1").unwrap()).unwrap();
    for (i, quantity) in ["DBZH", "TH"].iter().enumerate() {
        let group = format!("/dataset1/data{}", i + 1);
        c.add(Node::group(&group).unwrap()).unwrap();
        c.add(Node::group(&format!("{group}/what")).unwrap()).unwrap();
        c.add(Node::string_attribute(&format!("{group}/what/quantity"), quantity).unwrap())
            .unwrap();
        c.add(Node::scalar_attribute(&format!("{group}/what/gain"), 0.5f64).unwrap())
            .unwrap();
        let values: Vec<u8> = (0..360 * 8).map(|v| (v % 251) as u8 + i as u8).collect();
        c.add(
            Node::dataset(
                &format!("{group}/data"),
                Payload::from_values(&[360, 8], &values).unwrap(),
            )
            .unwrap(),
        )
        .unwrap();
    }
    c
}

// ---------------------------------------------------------------------------
// Round-trip
// ---------------------------------------------------------------------------

#[test]
fn round_trip_preserves_every_node() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pvol.h5");
    let engine = Engine::default();
    let mut written = polar_volume(&path);
    engine
        .write_full(&mut written, &CreationProperties::default(), None)
        .unwrap();

    let back = read_everything(&engine, &path);
    assert_eq!(summary(&back), summary(&written));
    assert!(back.iter().all(|n| n.mark() == Mark::Original));
    assert!(back.iter().all(|n| n.fetch() == Fetch::Full));
}

#[test]
fn round_trip_of_every_scalar_format() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("formats.h5");
    let mut c = Collection::with_filename(&path);
    c.add(Node::dataset("/i8", Payload::from_values(&[3], &[-1i8, 0, 1]).unwrap()).unwrap())
        .unwrap();
    c.add(Node::dataset("/u8", Payload::from_values(&[2], &[0u8, 255]).unwrap()).unwrap())
        .unwrap();
    c.add(Node::dataset("/i16", Payload::from_values(&[2], &[-300i16, 300]).unwrap()).unwrap())
        .unwrap();
    c.add(Node::dataset("/u16", Payload::from_values(&[1], &[65535u16]).unwrap()).unwrap())
        .unwrap();
    c.add(Node::dataset("/i32", Payload::from_values(&[1], &[i32::MIN]).unwrap()).unwrap())
        .unwrap();
    c.add(Node::dataset("/u32", Payload::from_values(&[1], &[u32::MAX]).unwrap()).unwrap())
        .unwrap();
    c.add(Node::dataset("/i64", Payload::from_values(&[1], &[-1i64 << 40]).unwrap()).unwrap())
        .unwrap();
    c.add(Node::dataset("/u64", Payload::from_values(&[1], &[1u64 << 63]).unwrap()).unwrap())
        .unwrap();
    c.add(Node::dataset("/f32", Payload::from_values(&[2], &[1.25f32, -0.5]).unwrap()).unwrap())
        .unwrap();
    c.add(Node::dataset("/f64", Payload::from_values(&[1], &[1e300f64]).unwrap()).unwrap())
        .unwrap();
    c.add(
        Node::dataset("/names", Payload::strings(&[3], &["DBZH", "TH", "VRADH"]).unwrap())
            .unwrap(),
    )
    .unwrap();
    let engine = Engine::default();
    engine
        .write_full(&mut c, &CreationProperties::default(), None)
        .unwrap();

    let back = read_everything(&engine, &path);
    assert_eq!(summary(&back), summary(&c));
    let get = |p: &str| back.get_by_name(p).unwrap();
    assert_eq!(get("/i8").format(), Some(FormatSpecifier::I8));
    assert_eq!(get("/u64").values::<u64>().unwrap(), vec![1u64 << 63]);
    assert_eq!(get("/f32").values::<f32>().unwrap(), vec![1.25, -0.5]);
    assert_eq!(
        get("/names").string_values().unwrap(),
        vec!["DBZH", "TH", "VRADH"]
    );
}

#[test]
fn creation_properties_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("small.h5");
    let props = CreationProperties::new()
        .userblock(512)
        .sizes(4, 4)
        .istore_k(4)
        .meta_block_size(0);
    let mut c = polar_volume(&path);
    for node in c.iter().map(|n| n.path().to_string()).collect::<Vec<_>>() {
        if node.ends_with("/data") {
            let n = c.get_mut_by_name(&node).unwrap();
            n.set_compression(Compression::deflate(4).unwrap()).unwrap();
            n.set_chunk_dims(&[45, 8]).unwrap();
        }
    }
    let engine = Engine::default();
    engine.write_full(&mut c, &props, None).unwrap();

    let bytes = std::fs::read(&path).unwrap();
    assert!(bytes[..512].iter().all(|&b| b == 0));
    let back = read_everything(&engine, &path);
    assert_eq!(summary(&back), summary(&c));
    let data = back.get_by_name("/dataset1/data2/data").unwrap();
    assert_eq!(data.compression(), Some(Compression::Deflate(4)));
    assert_eq!(data.chunk_dims(), Some(&[45, 8][..]));
}

// ---------------------------------------------------------------------------
// Invariants
// ---------------------------------------------------------------------------

#[test]
fn add_enforces_parent_invariant() {
    let mut c = Collection::new();
    let orphan = Node::scalar_attribute("/what/date", 20240101i32).unwrap();
    let rejected = c.add(orphan).unwrap_err();
    assert!(matches!(rejected.reason, Error::MissingParent(_)));
    assert_eq!(rejected.node.path(), "/what/date");

    c.add(Node::group("/what").unwrap()).unwrap();
    c.add(Node::string_attribute("/what/object", "PVOL").unwrap()).unwrap();
    let nested = c.add(Node::group("/what/object/inner").unwrap()).unwrap_err();
    assert!(matches!(nested.reason, Error::InvalidParentKind { .. }));
    let dup = c.add(Node::string_attribute("/what/object", "SCAN").unwrap()).unwrap_err();
    assert!(matches!(dup.reason, Error::DuplicatePath(_)));

    let top = Node::dataset("/top", Payload::from_values(&[1], &[1u8]).unwrap()).unwrap();
    c.add(top).unwrap();
    let under = Node::dataset("/what/d", Payload::from_values(&[1], &[1u8]).unwrap()).unwrap();
    c.add(under).unwrap();
    assert_eq!(c.len(), 4);
    assert_eq!(
        c.get_by_name("/what/object").unwrap().string_value().unwrap(),
        "PVOL"
    );
}

// ---------------------------------------------------------------------------
// Idempotence
// ---------------------------------------------------------------------------

#[test]
fn second_fetch_and_preload_are_no_ops() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pvol.h5");
    let engine = Engine::default();
    engine
        .write_full(&mut polar_volume(&path), &CreationProperties::default(), None)
        .unwrap();

    let mut c = engine.read_structure(&path, "").unwrap();
    assert!(c.select_datasets_only() > 0);
    assert_eq!(engine.fetch_marked(&mut c).unwrap(), 2);
    let before = summary(&c);
    assert_eq!(engine.fetch_marked(&mut c).unwrap(), 0);
    assert_eq!(summary(&c), before);

    let mut lazy = LazyLoader::with_engine(c, engine);
    assert_eq!(lazy.preload(None).unwrap(), 0);
}

#[test]
fn metadata_selection_then_full_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pvol.h5");
    let engine = Engine::default();
    engine
        .write_full(&mut polar_volume(&path), &CreationProperties::default(), None)
        .unwrap();

    let mut c = engine.read_structure(&path, "/dataset1").unwrap();
    assert!(!c.has_by_name("/what"));
    c.select_metadata_only();
    engine.fetch_marked(&mut c).unwrap();
    let data = c.get_by_name("/dataset1/data1/data").unwrap();
    assert_eq!(data.fetch(), Fetch::Metadata);
    assert_eq!(data.dims(), &[360, 8]);
    assert!(data.data().is_none());

    c.select("/dataset1/data1/data").unwrap();
    c.deselect("/dataset1/data1/data").unwrap();
    assert_eq!(engine.fetch_marked(&mut c).unwrap(), 0);
    let data = engine.fetch_one(&mut c, "/dataset1/data1/data").unwrap();
    assert_eq!(data.data().map(<[u8]>::len), Some(360 * 8));
}

// ---------------------------------------------------------------------------
// Lazy preload filter
// ---------------------------------------------------------------------------

#[test]
fn preload_fetches_allowed_and_untagged_datasets() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scan.h5");
    let mut c = Collection::with_filename(&path);
    c.add(Node::group("/dataset1").unwrap()).unwrap();
    for (i, quantity) in ["A", "B", "C", ""].iter().enumerate() {
        let group = format!("/dataset1/data{}", i + 1);
        c.add(Node::group(&group).unwrap()).unwrap();
        if !quantity.is_empty() {
            c.add(Node::group(&format!("{group}/what")).unwrap()).unwrap();
            c.add(Node::string_attribute(&format!("{group}/what/quantity"), quantity).unwrap())
                .unwrap();
        }
        let payload = Payload::from_values(&[4], &[i as i16; 4]).unwrap();
        c.add(Node::dataset(&format!("{group}/data"), payload).unwrap()).unwrap();
    }
    let engine = Engine::default();
    engine
        .write_full(&mut c, &CreationProperties::default(), None)
        .unwrap();

    let mut lazy = LazyLoader::open(&path, engine).unwrap();
    assert_eq!(lazy.preload(Some(&["A", "C"][..])).unwrap(), 3);
    assert!(lazy.is_loaded("/dataset1/data1/data"));
    assert!(!lazy.is_loaded("/dataset1/data2/data"));
    assert!(lazy.is_loaded("/dataset1/data3/data"));
    assert!(lazy.is_loaded("/dataset1/data4/data"));
    assert_eq!(lazy.preload(Some(&["A", "C"][..])).unwrap(), 0);

    // B is still reachable on demand
    let b = lazy.get_dataset("/dataset1/data2/data").unwrap();
    assert_eq!(b.values::<i16>().unwrap(), vec![1; 4]);
    assert!(lazy.is_loaded("/dataset1/data2/data"));
}

// ---------------------------------------------------------------------------
// Update vs. full write
// ---------------------------------------------------------------------------

#[test]
fn update_adds_only_the_new_node() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pvol.h5");
    let engine = Engine::default();
    engine
        .write_full(&mut polar_volume(&path), &CreationProperties::default(), None)
        .unwrap();
    let before = summary(&read_everything(&engine, &path));

    let mut c = engine.read_structure(&path, "").unwrap();
    let added = Node::scalar_attribute("/dataset1/data1/what/offset", -32.0f64).unwrap();
    c.add(added).unwrap();
    engine.update(&mut c, None).unwrap();
    assert_eq!(c.get_by_name("/dataset1/data1/what/offset").unwrap().mark(), Mark::Original);

    let after = read_everything(&engine, &path);
    let mut expected = before;
    let offset = (-32.0f64).to_ne_bytes().to_vec();
    let at = expected
        .iter()
        .position(|(p, ..)| p == "/dataset1/data1/what/gain")
        .unwrap();
    expected.insert(
        at + 1,
        (
            "/dataset1/data1/what/offset".to_string(),
            NodeKind::Attribute,
            vec![],
            Some(FormatSpecifier::F64),
            Some(offset),
        ),
    );
    assert_eq!(summary(&after), expected);

    // a second update with nothing new leaves the file alone
    let len = std::fs::metadata(&path).unwrap().len();
    engine.update(&mut c, None).unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), len);
}

#[test]
fn full_write_matches_scratch_build() {
    let dir = tempfile::tempdir().unwrap();
    let original = dir.path().join("pvol.h5");
    let engine = Engine::default();
    engine
        .write_full(&mut polar_volume(&original), &CreationProperties::default(), None)
        .unwrap();

    let mut c = read_everything(&engine, &original);
    c.add(Node::scalar_attribute("/where/lon", 25.0f64).unwrap()).unwrap();
    let rewritten = dir.path().join("rewritten.h5");
    c.set_filename(&rewritten);
    engine
        .write_full(&mut c, &CreationProperties::default(), None)
        .unwrap();

    let scratch = dir.path().join("scratch.h5");
    let mut fresh = polar_volume(&scratch);
    fresh.add(Node::scalar_attribute("/where/lon", 25.0f64).unwrap()).unwrap();
    engine
        .write_full(&mut fresh, &CreationProperties::default(), None)
        .unwrap();

    let a = read_everything(&engine, &rewritten);
    let b = read_everything(&engine, &scratch);
    let mut sa = summary(&a);
    let mut sb = summary(&b);
    sa.sort_by(|x, y| x.0.cmp(&y.0));
    sb.sort_by(|x, y| x.0.cmp(&y.0));
    assert_eq!(sa, sb);
}

#[test]
fn changed_payload_is_rewritten_by_full_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pvol.h5");
    let engine = Engine::default();
    engine
        .write_full(&mut polar_volume(&path), &CreationProperties::default(), None)
        .unwrap();

    let mut c = read_everything(&engine, &path);
    let node = c.get_mut_by_name("/dataset1/data1/data").unwrap();
    let mut data = node.take_data().unwrap().into_vec();
    data.iter_mut().for_each(|b| *b = 7);
    node.set_data(data.into()).unwrap();
    assert_eq!(node.mark(), Mark::Changed);
    assert!(matches!(engine.update(&mut c, None), Err(Error::Unsupported(_))));

    engine
        .write_full(&mut c, &CreationProperties::default(), None)
        .unwrap();
    let back = read_everything(&engine, &path);
    let values = back.get_by_name("/dataset1/data1/data").unwrap().values::<u8>().unwrap();
    assert!(values.iter().all(|&v| v == 7));
}

// ---------------------------------------------------------------------------
// Compound dedup
// ---------------------------------------------------------------------------

fn gate_type(name: &str) -> CompoundTypeDescription {
    let mut desc = CompoundTypeDescription::new(name, 16);
    desc.add_member("start", 0, 4, FormatSpecifier::I32, &[]).unwrap();
    desc.add_member("count", 4, 4, FormatSpecifier::U32, &[]).unwrap();
    desc.add_member("weight", 8, 8, FormatSpecifier::F64, &[]).unwrap();
    desc
}

#[test]
fn identical_compounds_keep_their_own_identity() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("types.h5");
    let mut c = Collection::with_filename(&path);
    c.add(Node::named_compound("/gate_a", gate_type("gate")).unwrap()).unwrap();
    c.add(Node::named_compound("/gate_b", gate_type("gate")).unwrap()).unwrap();
    let mut row = Vec::new();
    row.extend_from_slice(&3i32.to_ne_bytes());
    row.extend_from_slice(&9u32.to_ne_bytes());
    row.extend_from_slice(&0.25f64.to_ne_bytes());
    let payload = Payload::from_compound(&[1], gate_type("gate"), row.clone())
        .unwrap()
        .with_named_type("/gate_b");
    c.add(Node::dataset("/gates", payload).unwrap()).unwrap();
    let engine = Engine::default();
    engine
        .write_full(&mut c, &CreationProperties::default(), None)
        .unwrap();

    let back = read_everything(&engine, &path);
    let a = back.get_by_name("/gate_a").unwrap().compound().unwrap();
    let b = back.get_by_name("/gate_b").unwrap().compound().unwrap();
    assert_ne!(a.id, b.id);
    assert!(a.same_layout(b));
    assert_eq!(back.find_compound_description(a.id).unwrap().type_name, "gate_a");
    assert_eq!(back.find_compound_description(b.id).unwrap().type_name, "gate_b");

    let gates = back.get_by_name("/gates").unwrap();
    assert_eq!(gates.compound().unwrap().id, b.id);
    assert_eq!(gates.data().unwrap(), &row[..]);
    assert_eq!(gates.compound().unwrap().member("weight").unwrap().offset, 8);
}

// ---------------------------------------------------------------------------
// Native fixing vs. stored bytes
// ---------------------------------------------------------------------------

#[test]
fn fixed_values_beside_stored_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fixing.h5");
    let mut c = Collection::with_filename(&path);

    let big_u16 = Datatype::FixedPoint {
        size: 2,
        byte_order: DatatypeByteOrder::BigEndian,
        signed: false,
        bit_offset: 0,
        bit_precision: 16,
    };
    let stored = vec![1u8, 2, 0, 255];
    c.add(
        Node::dataset("/counts", Payload::with_native_type(&[2], big_u16, stored.clone()).unwrap())
            .unwrap(),
    )
    .unwrap();

    // u8 then u32 with no padding between them
    let mut packed = CompoundTypeDescription::new("flagged", 5);
    packed.add_member("flag", 0, 1, FormatSpecifier::U8, &[]).unwrap();
    packed.add_member("count", 1, 4, FormatSpecifier::U32, &[]).unwrap();
    let mut row = vec![7u8];
    row.extend_from_slice(&0x1234_5678u32.to_ne_bytes());
    c.add(Node::dataset("/flagged", Payload::from_compound(&[1], packed, row.clone()).unwrap()).unwrap())
        .unwrap();

    let engine = Engine::default();
    engine
        .write_full(&mut c, &CreationProperties::default(), None)
        .unwrap();
    let back = read_everything(&engine, &path);

    let counts = back.get_by_name("/counts").unwrap();
    assert_eq!(counts.format(), Some(FormatSpecifier::U16));
    assert_eq!(counts.values::<u16>().unwrap(), vec![0x0102, 0x00ff]);
    assert_eq!(counts.raw_data().unwrap(), &stored[..]);

    let flagged = back.get_by_name("/flagged").unwrap();
    let desc = flagged.compound().unwrap();
    assert_eq!(desc.size, 8);
    assert_eq!(desc.member("count").unwrap().offset, 4);
    let mut aligned = vec![7u8, 0, 0, 0];
    aligned.extend_from_slice(&0x1234_5678u32.to_ne_bytes());
    assert_eq!(flagged.data().unwrap(), &aligned[..]);
    assert_eq!(flagged.raw_data().unwrap(), &row[..]);
}

// ---------------------------------------------------------------------------
// Compression
// ---------------------------------------------------------------------------

#[test]
fn deflate_and_plain_decode_identically() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("compressed.h5");
    let values: Vec<f32> = (0..4096).map(|v| (v % 97) as f32 * 0.5).collect();
    let mut c = Collection::with_filename(&path);
    let mut packed =
        Node::dataset("/packed", Payload::from_values(&[64, 64], &values).unwrap()).unwrap();
    packed.set_compression(Compression::deflate(6).unwrap()).unwrap();
    c.add(packed).unwrap();
    c.add(Node::dataset("/plain", Payload::from_values(&[64, 64], &values).unwrap()).unwrap())
        .unwrap();
    let engine = Engine::default();
    engine
        .write_full(&mut c, &CreationProperties::default(), None)
        .unwrap();

    let back = read_everything(&engine, &path);
    let packed = back.get_by_name("/packed").unwrap();
    let plain = back.get_by_name("/plain").unwrap();
    assert_eq!(packed.compression(), Some(Compression::Deflate(6)));
    assert_eq!(plain.compression(), None);
    assert_eq!(packed.data(), plain.data());
    assert_eq!(packed.values::<f32>().unwrap(), values);
    assert!(std::fs::metadata(&path).unwrap().len() < 2 * 4096 * 4);
}

#[test]
fn engine_default_compression_applies_to_plain_datasets() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("defaulted.h5");
    let config = EngineConfig::new().default_compression(Compression::deflate(1).unwrap());
    let engine = Engine::new(config, Diagnostics::silent());
    engine
        .write_full(&mut polar_volume(&path), &CreationProperties::default(), None)
        .unwrap();
    let c = engine.read_structure(&path, "").unwrap();
    assert_eq!(
        c.get_by_name("/dataset1/data1/data").unwrap().compression(),
        Some(Compression::Deflate(1))
    );
}

// ---------------------------------------------------------------------------
// Diagnostics scoping
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn capturing_engine() -> (Engine, Captured) {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let diagnostics = Diagnostics::with_dispatch(tracing::Dispatch::new(subscriber));
    (Engine::new(EngineConfig::default(), diagnostics), captured)
}

#[test]
fn diagnostics_stay_with_their_engine() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pvol.h5");
    let (loud, captured) = capturing_engine();
    let quiet = Engine::default();

    quiet
        .write_full(&mut polar_volume(&path), &CreationProperties::default(), None)
        .unwrap();
    assert!(captured.0.lock().unwrap().is_empty());

    loud.read_structure(&path, "").unwrap();
    let text = String::from_utf8_lossy(&captured.0.lock().unwrap()).into_owned();
    assert!(text.contains("structure read"));
    assert!(text.contains("pvol.h5"));
}

#[test]
fn failed_write_is_reported_as_critical() {
    let dir = tempfile::tempdir().unwrap();
    let (loud, captured) = capturing_engine();
    let mut c = polar_volume(&dir.path().join("missing").join("pvol.h5"));
    let err = loud
        .write_full(&mut c, &CreationProperties::default(), None)
        .unwrap_err();
    assert!(matches!(err, Error::Io(_)));
    assert!(c.iter().all(|n| n.mark() == Mark::Created));
    let text = String::from_utf8_lossy(&captured.0.lock().unwrap()).into_owned();
    assert!(text.contains("ERROR") && text.contains("critical=true"));
}
