//! End-to-end tests of the engine over a synthetic one-segment image:
//! two-phase pointer resolution, identity dedup, partial classification,
//! partial-failure reads and string relocation on write.

mod common;

use binweave::{
    BinweaveError, CellWarning, CountSpec, Endianness, Engine, EngineConfig, RecordType,
    RelocationMode, TableKind,
};
use common::*;

fn engine_with(image: Vec<u8>) -> Engine {
    let len = image.len() as u64;
    Engine::new(image, single_segment(len), EngineConfig::default())
}

fn define_item(engine: &mut Engine) {
    engine
        .define_record(RecordType::builder("Item").uint32("value").build().unwrap())
        .unwrap();
}

fn define_group(engine: &mut Engine) {
    engine
        .define_record(
            RecordType::builder("Group")
                .uint32("count")
                .reference("items", "Item", CountSpec::Field("count".into()))
                .build()
                .unwrap(),
        )
        .unwrap();
}

#[test]
fn ref_count_resolves_from_sibling_field() {
    let mut buf = image(0x1000);
    // Two Group records at 0x100; their item arrays at 0x200 and 0x220.
    put_u32(&mut buf, 0x100, 3);
    put_u32(&mut buf, 0x104, vma(0x200));
    put_u32(&mut buf, 0x108, 2);
    put_u32(&mut buf, 0x10c, vma(0x220));
    for (i, v) in [10u32, 11, 12].iter().enumerate() {
        put_u32(&mut buf, 0x200 + 4 * i, *v);
    }
    for (i, v) in [20u32, 21].iter().enumerate() {
        put_u32(&mut buf, 0x220 + 4 * i, *v);
    }

    let mut engine = engine_with(buf);
    define_item(&mut engine);
    define_group(&mut engine);
    let gid = engine
        .declare_table("groups", BASE_VMA + 0x100, 2, "Group")
        .unwrap();
    engine.read().unwrap();

    let groups = engine.table(&gid).unwrap();
    assert_eq!(groups.entries().len(), 2);
    assert_eq!(groups.entries()[0].uint("count").unwrap(), 3);
    let sub0 = groups.entries()[0].ref_id("items").unwrap().unwrap().clone();
    let sub1 = groups.entries()[1].ref_id("items").unwrap().unwrap().clone();
    assert_eq!(sub0.as_str(), "implicit_400200");
    assert_ne!(sub0, sub1);

    let t0 = engine.table(&sub0).unwrap();
    assert_eq!(t0.entries().len(), 3);
    let values: Vec<u64> = t0
        .entries()
        .iter()
        .map(|e| e.uint("value").unwrap())
        .collect();
    assert_eq!(values, vec![10, 11, 12]);
    assert_eq!(engine.table(&sub1).unwrap().entries().len(), 2);

    let cell = engine.registry().cell(&sub0).unwrap();
    assert_eq!(cell.kind(), &TableKind::Single);
    assert_eq!(cell.ref_count(), 1);
}

#[test]
fn ref_resolution_ignores_field_declaration_order() {
    // Same shape as above, but the pointer precedes its count field.
    let mut buf = image(0x1000);
    put_u32(&mut buf, 0x100, vma(0x200));
    put_u32(&mut buf, 0x104, 4);
    for i in 0..4u32 {
        put_u32(&mut buf, 0x200 + 4 * i as usize, 30 + i);
    }

    let mut engine = engine_with(buf);
    define_item(&mut engine);
    engine
        .define_record(
            RecordType::builder("GroupSwapped")
                .reference("items", "Item", CountSpec::Field("count".into()))
                .uint32("count")
                .build()
                .unwrap(),
        )
        .unwrap();
    let gid = engine
        .declare_table("groups", BASE_VMA + 0x100, 1, "GroupSwapped")
        .unwrap();
    engine.read().unwrap();

    let entry = &engine.table(&gid).unwrap().entries()[0];
    assert_eq!(entry.uint("count").unwrap(), 4);
    let sub = entry.ref_id("items").unwrap().unwrap().clone();
    assert_eq!(engine.table(&sub).unwrap().entries().len(), 4);
}

#[test]
fn references_to_the_same_array_share_one_identity() {
    let mut buf = image(0x1000);
    // Both groups point at the same 3-element array.
    put_u32(&mut buf, 0x100, 3);
    put_u32(&mut buf, 0x104, vma(0x200));
    put_u32(&mut buf, 0x108, 3);
    put_u32(&mut buf, 0x10c, vma(0x200));

    let mut engine = engine_with(buf);
    define_item(&mut engine);
    define_group(&mut engine);
    let gid = engine
        .declare_table("groups", BASE_VMA + 0x100, 2, "Group")
        .unwrap();
    engine.read().unwrap();

    let groups = engine.table(&gid).unwrap();
    let sub0 = groups.entries()[0].ref_id("items").unwrap().unwrap().clone();
    let sub1 = groups.entries()[1].ref_id("items").unwrap().unwrap().clone();
    assert_eq!(sub0, sub1);
    assert_eq!(engine.registry().cell(&sub0).unwrap().ref_count(), 2);
    // Only the primary and the one deduped single exist.
    assert_eq!(engine.registry().cells().len(), 2);
}

#[test]
fn pointer_into_primary_classifies_as_partial() {
    let mut buf = image(0x1000);
    // Primary Item table: 20 elements at 0x400.
    for i in 0..20u32 {
        put_u32(&mut buf, 0x400 + 4 * i as usize, i);
    }
    // Group entry 0 points at element 3 with count 5; entry 1 references
    // the whole table.
    put_u32(&mut buf, 0x100, 5);
    put_u32(&mut buf, 0x104, vma(0x40c));
    put_u32(&mut buf, 0x108, 20);
    put_u32(&mut buf, 0x10c, vma(0x400));

    let mut engine = engine_with(buf);
    define_item(&mut engine);
    define_group(&mut engine);
    let items_id = engine
        .declare_table("items", BASE_VMA + 0x400, 20, "Item")
        .unwrap();
    let gid = engine
        .declare_table("groups", BASE_VMA + 0x100, 2, "Group")
        .unwrap();
    engine.read().unwrap();

    let groups = engine.table(&gid).unwrap();
    let partial = groups.entries()[0].ref_id("items").unwrap().unwrap().clone();
    let whole = groups.entries()[1].ref_id("items").unwrap().unwrap().clone();

    assert_eq!(partial.as_str(), "items:3");
    let cell = engine.registry().cell(&partial).unwrap();
    assert_eq!(
        cell.kind(),
        &TableKind::Partial {
            parent: items_id.clone(),
            index: 3
        }
    );
    assert_eq!(cell.ref_count(), 1);
    // A partial cell owns no table and no allocator space.
    assert!(engine.table(&partial).is_none());
    assert!(engine.allocator().ranges().is_empty());

    // The whole-table reference folds into the primary itself.
    assert_eq!(whole, items_id);
    assert_eq!(engine.registry().cell(&items_id).unwrap().ref_count(), 1);
    // groups, items, and the one partial cell; never a shadow single.
    assert_eq!(engine.registry().cells().len(), 3);
    assert_eq!(
        engine.table(&items_id).unwrap().entries()[3]
            .uint("value")
            .unwrap(),
        3
    );
}

fn define_talk(engine: &mut Engine) {
    engine
        .define_record(
            RecordType::builder("Talk")
                .cstring("text", true)
                .build()
                .unwrap(),
        )
        .unwrap();
}

#[test]
fn unreachable_pointer_truncates_instead_of_failing() {
    let mut buf = image(0x1000);
    // 10 Talk entries at 0x500; the 6th points outside the segment.
    for i in 0..5usize {
        put_u32(&mut buf, 0x500 + 4 * i, vma(0x600 + 0x10 * i));
        put_cstr(&mut buf, 0x600 + 0x10 * i, &format!("line_{i}"));
    }
    put_u32(&mut buf, 0x500 + 4 * 5, (BASE_VMA + 0x10_0000) as u32);

    let mut engine = engine_with(buf);
    define_talk(&mut engine);
    let tid = engine
        .declare_table("talks", BASE_VMA + 0x500, 10, "Talk")
        .unwrap();
    engine.read().unwrap();

    let table = engine.table(&tid).unwrap();
    assert_eq!(table.declared_count(), 10);
    assert_eq!(table.entries().len(), 5);
    assert_eq!(
        table.entries()[4].string_bytes("text").unwrap().unwrap(),
        b"line_4"
    );

    {
        let warnings: Vec<_> = engine.warnings().collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].0, &tid);
        assert_eq!(
            warnings[0].1,
            &CellWarning::RecordTruncated {
                read: 5,
                declared: 10
            }
        );
    }

    // A truncated table cannot be written back as-is.
    let err = engine.write().unwrap_err();
    assert!(matches!(
        err,
        BinweaveError::SizeMismatch {
            expected: 10,
            actual: 5
        }
    ));
}

#[test]
fn edited_strings_relocate_and_dedup_on_write() {
    let mut buf = image(0x1000);
    for (i, text) in ["alpha", "beta", "gamma"].iter().enumerate() {
        put_u32(&mut buf, 0x500 + 4 * i, vma(0x600 + 0x10 * i));
        put_cstr(&mut buf, 0x600 + 0x10 * i, text);
    }

    let mut engine = engine_with(buf);
    define_talk(&mut engine);
    let tid = engine
        .declare_table("talks", BASE_VMA + 0x500, 3, "Talk")
        .unwrap();
    engine.read().unwrap();
    // Reading reserved the original string storage for reuse.
    assert!(!engine.allocator().ranges().is_empty());

    // Extra room for the oversized replacement.
    engine.register_free(0x700, 0x40, 8).unwrap();

    let table = engine.table_mut(&tid).unwrap();
    table.entries_mut()[0]
        .set_string("text", Some(b"ALPHA PRIME EDITION".as_slice()))
        .unwrap();
    table.entries_mut()[2]
        .set_string("text", Some(b"beta".as_slice()))
        .unwrap();
    engine.write().unwrap();

    let img = engine.image();
    assert_eq!(deref_cstr(img, 0x500), "ALPHA PRIME EDITION");
    assert_eq!(deref_cstr(img, 0x504), "beta");
    assert_eq!(deref_cstr(img, 0x508), "beta");
    // Identical content shares one address.
    assert_eq!(get_u32(img, 0x504), get_u32(img, 0x508));
}

#[test]
fn pinned_strings_round_trip_through_their_address() {
    let mut buf = image(0x1000);
    put_u32(&mut buf, 0x500, vma(0x600));
    // Second entry is the null sentinel.
    put_u32(&mut buf, 0x504, 0);
    put_cstr(&mut buf, 0x600, "fixed");

    let mut engine = engine_with(buf);
    engine
        .define_record(
            RecordType::builder("Label")
                .cstring("text", false)
                .build()
                .unwrap(),
        )
        .unwrap();
    let tid = engine
        .declare_table("labels", BASE_VMA + 0x500, 2, "Label")
        .unwrap();
    engine.read().unwrap();

    {
        let table = engine.table(&tid).unwrap();
        assert_eq!(
            table.entries()[0].string_bytes("text").unwrap().unwrap(),
            b"fixed"
        );
        assert_eq!(table.entries()[1].string_bytes("text").unwrap(), None);
    }

    let table = engine.table_mut(&tid).unwrap();
    table.entries_mut()[0]
        .set_string("text", Some(b"fixup".as_slice()))
        .unwrap();
    engine.write().unwrap();

    let img = engine.image();
    assert_eq!(get_u32(img, 0x500), vma(0x600));
    assert_eq!(deref_cstr(img, 0x500), "fixup");
    assert_eq!(get_u32(img, 0x504), 0);
}

#[test]
fn in_place_mode_never_moves_relocatable_strings() {
    let mut buf = image(0x1000);
    put_u32(&mut buf, 0x500, vma(0x600));
    put_cstr(&mut buf, 0x600, "stay");

    let len = buf.len() as u64;
    let config = EngineConfig {
        relocation: RelocationMode::InPlace,
        ..EngineConfig::default()
    };
    let mut engine = Engine::new(buf, single_segment(len), config);
    define_talk(&mut engine);
    let tid = engine
        .declare_table("talks", BASE_VMA + 0x500, 1, "Talk")
        .unwrap();
    engine.read().unwrap();
    // In-place mode reserves nothing.
    assert!(engine.allocator().ranges().is_empty());

    let table = engine.table_mut(&tid).unwrap();
    table.entries_mut()[0]
        .set_string("text", Some(b"put".as_slice()))
        .unwrap();
    engine.write().unwrap();

    assert_eq!(get_u32(engine.image(), 0x500), vma(0x600));
    assert_eq!(deref_cstr(engine.image(), 0x500), "put");
}

#[test]
fn open_image_honors_the_files_byte_order() -> anyhow::Result<()> {
    let mut buf = minimal_elf(false, 0x100);
    buf[0x80..0x84].copy_from_slice(&7u32.to_be_bytes());

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("big.img");
    std::fs::write(&path, &buf)?;

    // Caller config says little endian; the image itself wins.
    let mut engine = Engine::open_image(&path, EngineConfig::default())?;
    assert_eq!(engine.config().endianness, Endianness::Big);
    assert_eq!(engine.image_name(), "big.img");

    define_item(&mut engine);
    let tid = engine.declare_table("items", BASE_VMA + 0x80, 1, "Item")?;
    engine.read()?;
    assert_eq!(engine.table(&tid).unwrap().entries()[0].uint("value")?, 7);
    Ok(())
}

#[test]
fn declaring_over_an_implicit_cell_is_a_conflict() {
    let mut buf = image(0x1000);
    put_u32(&mut buf, 0x100, 3);
    put_u32(&mut buf, 0x104, vma(0x200));

    let mut engine = engine_with(buf);
    define_item(&mut engine);
    define_group(&mut engine);
    let gid = engine
        .declare_table("groups", BASE_VMA + 0x100, 1, "Group")
        .unwrap();
    engine.read().unwrap();
    let implicit = engine.table(&gid).unwrap().entries()[0]
        .ref_id("items")
        .unwrap()
        .unwrap()
        .clone();

    // Incompatible count: hard error.
    let err = engine
        .declare_table("late", BASE_VMA + 0x200, 7, "Item")
        .unwrap_err();
    assert!(matches!(err, BinweaveError::IdentityConflict { .. }));

    // Compatible declaration folds into the implicit cell with a warning.
    let folded = engine
        .declare_table("late", BASE_VMA + 0x200, 3, "Item")
        .unwrap();
    assert_eq!(folded, implicit);
    assert!(engine
        .warnings()
        .any(|(id, w)| id == &implicit
            && w == &CellWarning::IdentityConflict {
                declared: "late".into()
            }));
}
