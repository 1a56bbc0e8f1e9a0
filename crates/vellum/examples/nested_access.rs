//! Example of navigating nested values without parsing.
//!
//! cargo run --package vellum --example nested_access

use vellum::json::from_json;
use vellum::{KeyPath, Typed};

fn main() -> Result<(), vellum::Error> {
    let doc = from_json(r#"{"users": [{"name": "Amy"}, {"name": "Bob"}]}"#)?;

    // Step through the tree by hand...
    let users = doc.root().as_map().get("users").expect("users");
    let Typed::Array(users) = users.typed() else {
        panic!("expected an array")
    };
    let second = users.get(1).expect("two users");
    let name = second.as_map().get("name").expect("name");
    println!("{}", name.as_str());

    // ...or compile a key-path once and reuse it.
    let path = KeyPath::parse("users[0].name")?;
    if let Some(first) = path.eval(&doc.root()) {
        println!("{}", first.as_str());
    }
    Ok(())
}
