//! End-to-end scenarios: encode, navigate, amend, mutate, diff.

use std::sync::Arc;

use vellum::delta::{apply_delta, create_delta};
use vellum::json::{from_json, from_json_with_shared_keys, to_json, to_json_opts, JsonOptions};
use vellum::{
    CopyFlags, DeepIterator, Doc, Encoder, KeyPath, MutableMap, SharedKeys, Trust, Typed, Value,
};

const SAMPLE: &str = r#"{"a":1,"b":"hi","c":[true,null,3.5]}"#;

#[test]
fn test_encode_small_and_canonical() {
    let doc = from_json(SAMPLE).unwrap();
    assert!(doc.data().len() <= 64, "got {} bytes", doc.data().len());
    assert_eq!(to_json(&doc.root()).unwrap(), SAMPLE);
}

#[test]
fn test_reencode_is_equal() {
    let doc = from_json(SAMPLE).unwrap();
    let mut enc = Encoder::new();
    enc.write_value(&doc.root()).unwrap();
    let copy = enc.finish_doc().unwrap();
    assert!(doc.root().is_equal(&copy.root()));
    // Deep-equality agreement with canonical JSON.
    let canonical = JsonOptions {
        canonical: true,
        ..JsonOptions::default()
    };
    assert_eq!(
        to_json_opts(&doc.root(), &canonical).unwrap(),
        to_json_opts(&copy.root(), &canonical).unwrap()
    );
}

#[test]
fn test_amend_with_reused_strings() {
    let sk = Arc::new(SharedKeys::new());
    let base_doc = from_json_with_shared_keys(SAMPLE, Some(Arc::clone(&sk))).unwrap();
    let base: Arc<[u8]> = Arc::from(base_doc.data());
    let first_size = base.len();

    let mut enc = Encoder::new();
    enc.set_shared_keys(Arc::clone(&sk));
    enc.set_base(Arc::clone(&base), false).unwrap();
    enc.reuse_base_strings().unwrap();
    vellum::json::convert_json(&mut enc, SAMPLE).unwrap();
    let amendment = enc.finish().unwrap();

    // The second copy shares "hi" (and the interned keys), so it grows the
    // buffer by strictly fewer bytes than the first encode took.
    assert!(
        amendment.len() < first_size,
        "amendment {} vs base {first_size}",
        amendment.len()
    );

    let combined: Arc<[u8]> = Arc::from([&base[..], &amendment[..]].concat().as_slice());
    let doc = Doc::from_data(combined, Trust::Untrusted, Some(sk), None).unwrap();
    assert_eq!(to_json(&doc.root()).unwrap(), SAMPLE);
}

#[test]
fn test_key_paths() {
    let doc = from_json(SAMPLE).unwrap();
    let root = doc.root();
    let v = KeyPath::eval_once("c[2]", &root).unwrap().unwrap();
    assert!(matches!(v.typed(), Typed::Float(x) if (f64::from(x) - 3.5).abs() < f64::EPSILON));
    assert!(KeyPath::eval_once("c[9]", &root).unwrap().is_none());
}

#[test]
fn test_mutable_copy_edit_reencode() {
    let doc = from_json(SAMPLE).unwrap();
    let mut map = MutableMap::from_value(&doc.root(), CopyFlags::default()).unwrap();
    assert!(!map.is_changed());
    map.set("a", 2i64);
    assert!(map.is_changed());
    assert!(map.source().unwrap().is_equal(&doc.root()));

    let mut enc = Encoder::new();
    enc.write_mutable_map(&map).unwrap();
    let doc2 = enc.finish_doc().unwrap();
    let reread = doc2.root().as_map();
    assert_eq!(reread.get("a").unwrap().as_int(), 2);
    assert_eq!(reread.get("b").unwrap().as_str(), "hi");
    assert!(reread
        .get("c")
        .unwrap()
        .is_equal(&doc.root().as_map().get("c").unwrap()));
}

#[test]
fn test_json_delta_scenario() {
    let old = from_json(r#"{"a":1}"#).unwrap();
    let new = from_json(r#"{"a":2,"b":[1]}"#).unwrap();
    let patch = create_delta(&old.root(), &new.root()).unwrap().unwrap();
    let bytes = apply_delta(&old.root(), &patch).unwrap();
    let applied = Value::from_data(&bytes).unwrap();
    assert!(applied.is_equal(&new.root()));
}

#[test]
fn test_deep_iteration_scenario() {
    let doc = from_json(SAMPLE).unwrap();
    let mut it = DeepIterator::new(doc.root());
    let mut paths = Vec::new();
    while it.next().is_some() {
        paths.push(it.path_string());
    }
    assert_eq!(paths, ["a", "b", "c", "c[0]", "c[1]", "c[2]"]);

    let mut it = DeepIterator::new(doc.root());
    let mut paths = Vec::new();
    while let Some(v) = it.next() {
        paths.push(it.path_string());
        if matches!(v.typed(), Typed::Array(_)) {
            it.skip_children();
        }
    }
    assert_eq!(paths, ["a", "b", "c"]);
}

#[test]
fn test_wide_count_container() {
    // More pairs than the 11-bit count field holds forces the varint
    // count form, and enough payload forces wide slots via pointer reach.
    let mut enc = Encoder::new();
    enc.begin_array(3000).unwrap();
    for i in 0..3000i64 {
        enc.write_int(i * 1000).unwrap(); // mostly out-of-line
    }
    enc.end_array().unwrap();
    let bytes = enc.finish().unwrap();

    let root = Value::from_data(&bytes).unwrap();
    let arr = root.as_array();
    assert_eq!(arr.count(), 3000);
    assert_eq!(arr.get(0).unwrap().as_int(), 0);
    assert_eq!(arr.get(1).unwrap().as_int(), 1000);
    assert_eq!(arr.get(2999).unwrap().as_int(), 2_999_000);
    // The iterator agrees with indexed access.
    assert_eq!(arr.iter().count(), 3000);
    let sum: i64 = arr.iter().map(|v| v.as_int()).sum();
    assert_eq!(sum, (0..3000i64).map(|i| i * 1000).sum::<i64>());
}

#[test]
fn test_far_root_trailer_indirection() {
    // An out-of-line scalar root is written where it is; a 70k string
    // leaves the root more than 2^15 units before the trailer, forcing
    // the wide-pointer indirection.
    let mut enc = Encoder::new();
    let filler: String = "y".repeat(70_000);
    enc.write_str(&filler).unwrap();
    let bytes = enc.finish().unwrap();
    let root = Value::from_data(&bytes).unwrap();
    assert_eq!(root.as_str().len(), 70_000);
}

#[test]
fn test_wide_slot_container() {
    // A slot whose target lies farther back than a narrow pointer reaches
    // promotes the whole container to 4-byte slots.
    let mut enc = Encoder::new();
    enc.begin_array(3).unwrap();
    enc.begin_map(1).unwrap();
    enc.write_key("far").unwrap();
    enc.write_int(1).unwrap();
    enc.end_map().unwrap();
    let filler: String = "x".repeat(70_000);
    enc.write_str(&filler).unwrap();
    enc.write_int(5).unwrap(); // inline cell inside a wide container
    enc.end_array().unwrap();
    let bytes = enc.finish().unwrap();

    let root = Value::from_data(&bytes).unwrap();
    let arr = root.as_array();
    assert_eq!(arr.count(), 3);
    assert_eq!(arr.get(0).unwrap().as_map().get("far").unwrap().as_int(), 1);
    assert_eq!(arr.get(1).unwrap().as_str().len(), 70_000);
    assert_eq!(arr.get(2).unwrap().as_int(), 5);
}

#[test]
fn test_amendment_extern_doc() {
    // Invariant: decoding concat(base, amendment) equals the amendment
    // opened with the base as extern destination.
    let base_doc = from_json(r#"{"shared":"payload"}"#).unwrap();
    let base: Arc<[u8]> = Arc::from(base_doc.data());

    let mut enc = Encoder::new();
    enc.set_base(Arc::clone(&base), true).unwrap();
    enc.begin_map(2).unwrap();
    enc.write_key("base").unwrap();
    enc.write_value(&Value::from_trusted_data(&base).unwrap()).unwrap();
    enc.write_key("n").unwrap();
    enc.write_int(7).unwrap();
    enc.end_map().unwrap();
    let doc = enc.finish_doc().unwrap();

    let map = doc.root().as_map();
    assert_eq!(map.get("n").unwrap().as_int(), 7);
    let inner = map.get("base").unwrap().as_map();
    assert_eq!(inner.get("shared").unwrap().as_str(), "payload");
}

#[test]
fn test_containing_across_docs() {
    let doc1 = from_json(r#"{"x":[1,2,3]}"#).unwrap();
    let doc2 = from_json(r#"{"y":true}"#).unwrap();

    let x = doc1.root().as_map().get("x").unwrap();
    let elem = x.as_array().get(1).unwrap();
    let owner = Doc::containing(&elem).unwrap();
    assert_eq!(owner.data().as_ptr(), doc1.data().as_ptr());

    let y = doc2.root().as_map().get("y").unwrap();
    let owner = Doc::containing(&y).unwrap();
    assert_eq!(owner.data().as_ptr(), doc2.data().as_ptr());
}
