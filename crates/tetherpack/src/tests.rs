use crate::*;

// ============================================================================
//  SCALARS
// ============================================================================

#[test]
fn test_scalar_roundtrip() -> Result<()> {
    let mut enc = Encoder::new();
    enc.unit()?;
    enc.bool(true)?;
    enc.bool(false)?;
    enc.u8(255)?;
    enc.u32(u32::MAX)?;
    enc.u64(u64::MAX)?;
    enc.s64(i64::MIN)?;
    enc.f64(-1.5)?;
    enc.option_none()?;

    let bytes = enc.into_bytes()?;
    let mut dec = Decoder::new(&bytes);

    dec.unit()?;
    assert!(dec.bool()?);
    assert!(!dec.bool()?);
    assert_eq!(dec.u8()?, 255);
    assert_eq!(dec.u32()?, u32::MAX);
    assert_eq!(dec.u64()?, u64::MAX);
    assert_eq!(dec.s64()?, i64::MIN);
    assert_eq!(dec.f64()?, -1.5);
    assert!(dec.option()?.is_none());
    assert_eq!(dec.remaining(), 0);
    Ok(())
}

#[test]
fn test_blobs_roundtrip() -> Result<()> {
    let mut enc = Encoder::new();
    enc.str("")?;
    enc.str("héllo")?;
    enc.bytes(&[0, 1, 2, 255])?;

    let bytes = enc.into_bytes()?;
    let mut dec = Decoder::new(&bytes);

    assert_eq!(dec.str()?, "");
    assert_eq!(dec.str()?, "héllo");
    assert_eq!(dec.bytes()?, &[0, 1, 2, 255]);
    Ok(())
}

#[test]
fn test_wrong_tag_is_reported() -> Result<()> {
    let mut enc = Encoder::new();
    enc.u32(7)?;
    let bytes = enc.into_bytes()?;

    let err = Decoder::new(&bytes).u64().unwrap_err();
    assert_eq!(err, Error::UnexpectedTag { expected: Tag::U64, found: Tag::U32 });
    Ok(())
}

#[test]
fn test_truncated_input() {
    let mut dec = Decoder::new(&[Tag::U64 as u8, 1, 2]);
    assert_eq!(dec.u64().unwrap_err(), Error::UnexpectedEnd);

    let mut dec = Decoder::new(&[0xEE]);
    assert_eq!(dec.skip().unwrap_err(), Error::InvalidTag(0xEE));
}

// ============================================================================
//  CONTAINERS
// ============================================================================

#[test]
fn test_nested_containers() -> Result<()> {
    let mut enc = Encoder::new();
    enc.map_begin()?;
    enc.variant_begin("ids")?;
    enc.list_begin()?;
    enc.u64(1)?;
    enc.u64(2)?;
    enc.list_end()?;
    enc.variant_end()?;
    enc.variant_begin("name")?;
    enc.option_some_begin()?;
    enc.str("calc")?;
    enc.option_some_end()?;
    enc.variant_end()?;
    enc.map_end()?;

    let bytes = enc.into_bytes()?;
    let mut dec = Decoder::new(&bytes);
    let mut map = dec.map()?;

    let (key, mut val) = map.next()?.expect("ids entry");
    assert_eq!(key, "ids");
    let mut ids = val.list()?;
    assert_eq!(ids.next()?.expect("first").u64()?, 1);
    assert_eq!(ids.next()?.expect("second").u64()?, 2);
    assert!(ids.next()?.is_none());

    let (key, mut val) = map.next()?.expect("name entry");
    assert_eq!(key, "name");
    assert_eq!(val.option()?.expect("some").str()?, "calc");
    assert!(map.next()?.is_none());
    Ok(())
}

#[test]
fn test_skip_unknown_map_entries() -> Result<()> {
    let mut enc = Encoder::new();
    enc.list_begin()?;
    enc.list_begin()?;
    enc.str("ignored")?;
    enc.list_end()?;
    enc.s64(-3)?;
    enc.list_end()?;

    let bytes = enc.into_bytes()?;
    let mut dec = Decoder::new(&bytes);
    let mut list = dec.list()?;
    list.next()?.expect("nested").skip()?;
    assert_eq!(list.next()?.expect("scalar").s64()?, -3);
    Ok(())
}

// ============================================================================
//  STRUCTURAL VIOLATIONS
// ============================================================================

#[test]
fn test_map_rejects_non_variant() -> Result<()> {
    let mut enc = Encoder::new();
    enc.map_begin()?;
    assert_eq!(enc.u8(1).unwrap_err(), Error::InvalidMapEntry);
    Ok(())
}

#[test]
fn test_variant_requires_exactly_one_item() -> Result<()> {
    let mut enc = Encoder::new();
    enc.variant_begin("v")?;
    assert_eq!(enc.variant_end().unwrap_err(), Error::EmptyAdt(Scope::Variant));
    enc.unit()?;
    assert_eq!(enc.unit().unwrap_err(), Error::TooManyItems(Scope::Variant));
    enc.variant_end()?;
    enc.into_bytes()?;
    Ok(())
}

#[test]
fn test_scope_errors() -> Result<()> {
    let mut enc = Encoder::new();
    assert_eq!(enc.list_end().unwrap_err(), Error::ScopeUnderflow);
    enc.list_begin()?;
    assert_eq!(
        enc.map_end().unwrap_err(),
        Error::ScopeMismatch { expected: Scope::Map, actual: Scope::List }
    );
    assert_eq!(enc.into_bytes().unwrap_err(), Error::ScopeStillOpen);
    Ok(())
}

// ============================================================================
//  VARINTS
// ============================================================================

#[test]
fn test_varint_boundaries() -> Result<()> {
    for v in [0u64, 1, 127, 128, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
        let mut buf = Vec::new();
        varint::write_u64(&mut buf, v);
        assert_eq!(buf.len(), varint::encoded_len(v), "length of {}", v);

        let mut cursor = buf.as_slice();
        assert_eq!(varint::read_u64(&mut cursor)?, v);
        assert!(cursor.is_empty());
    }
    Ok(())
}

#[test]
fn test_varint_overflow() {
    let mut cursor: &[u8] = &[0xFF; 11];
    assert_eq!(varint::read_u64(&mut cursor).unwrap_err(), Error::VarintOverflow);

    let mut cursor: &[u8] = &[0x80, 0x80];
    assert_eq!(varint::read_u64(&mut cursor).unwrap_err(), Error::UnexpectedEnd);
}
