use crate::strings::StringStorage;

#[test]
fn interning_assigns_sequential_ids() {
    let mut storage = StringStorage::default();
    assert_eq!(storage.get_or_add("alpha"), 0);
    assert_eq!(storage.get_or_add("beta"), 1);
    assert_eq!(storage.get_or_add("gamma"), 2);
    assert_eq!(storage.count(), 3);
}

#[test]
fn duplicates_return_the_original_id() {
    let mut storage = StringStorage::default();
    let a = storage.get_or_add("path/to/somewhere");
    storage.get_or_add("other");
    assert_eq!(storage.get_or_add("path/to/somewhere"), a);
    assert_eq!(storage.count(), 2);
}

#[test]
fn lookup_by_id_and_by_content() {
    let mut storage = StringStorage::default();
    let id = storage.get_or_add("hello");
    assert_eq!(storage.get_str(id), Some("hello"));
    assert_eq!(storage.get("hello"), Some(id));
    assert_eq!(storage.get("missing"), None);
    assert_eq!(storage.get_str(99), None);
    assert!(storage.contains("hello"));
    assert!(!storage.contains("missing"));
    assert!(storage.contains_id(id));
    assert!(!storage.contains_id(99));
}

#[test]
fn empty_string_interns_once() {
    let mut storage = StringStorage::default();
    let id = storage.get_or_add("");
    assert_eq!(storage.get_or_add(""), id);
    assert_eq!(storage.get_str(id), Some(""));
}

#[test]
fn iteration_follows_id_order() {
    let mut storage = StringStorage::default();
    for name in ["c", "a", "b"] {
        storage.get_or_add(name);
    }
    let pairs: Vec<(u32, String)> = storage.iter().map(|(i, s)| (i, s.to_string())).collect();
    assert_eq!(
        pairs,
        vec![(0, "c".into()), (1, "a".into()), (2, "b".into())]
    );
}

#[test]
fn survives_many_interned_strings() {
    let mut storage = StringStorage::new(4096);
    let mut ids = Vec::new();
    for i in 0..5000 {
        ids.push(storage.get_or_add(&format!("entry/number/{i}")));
    }
    for (i, id) in ids.iter().enumerate() {
        assert_eq!(storage.get_str(*id).unwrap(), format!("entry/number/{i}"));
        assert_eq!(storage.get(&format!("entry/number/{i}")), Some(*id));
    }
}

#[test]
fn clear_resets_ids_and_memory() {
    let mut storage = StringStorage::default();
    storage.get_or_add("one");
    storage.clear();
    assert_eq!(storage.count(), 0);
    assert_eq!(storage.get("one"), None);
    assert_eq!(storage.get_or_add("two"), 0);
}
