//! Packing test vector validation
//!
//! Vectors in testdata/packing-vectors.json were produced independently of
//! this crate; the codec is also cross-checked against the `base64` crate.

use anyhow::Result;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use serde::Deserialize;

use easysign::codec;
use easysign::pem::{self, KeyType, WrappedKey};

#[derive(Debug, Deserialize)]
struct PackingVector {
    comment: String,
    key_type: Option<String>,
    iv: String,
    salt: String,
    wrapped: String,
    packed: String,
    packed_folded: String,
}

fn load_packing_vectors() -> Result<Vec<PackingVector>> {
    let json_data = include_str!("../testdata/packing-vectors.json");
    let vectors: Vec<PackingVector> = serde_json::from_str(json_data)?;
    Ok(vectors)
}

fn wrapped_key(vector: &PackingVector) -> Result<WrappedKey> {
    let key_type = vector
        .key_type
        .as_deref()
        .map(str::parse::<KeyType>)
        .transpose()?;
    let iv: [u8; 16] = BASE64_STANDARD
        .decode(&vector.iv)?
        .try_into()
        .map_err(|_| anyhow::anyhow!("iv is not 16 bytes"))?;
    let salt: [u8; 16] = BASE64_STANDARD
        .decode(&vector.salt)?
        .try_into()
        .map_err(|_| anyhow::anyhow!("salt is not 16 bytes"))?;
    let wrapped = BASE64_STANDARD.decode(&vector.wrapped)?;
    Ok(WrappedKey::new(key_type, &iv, &salt, &wrapped))
}

#[test]
fn test_all_packing_vectors() {
    let vectors = load_packing_vectors().expect("failed to load packing vectors");
    println!("Testing {} packing vectors", vectors.len());

    for (i, vector) in vectors.iter().enumerate() {
        let key = wrapped_key(vector).expect("malformed vector");

        assert_eq!(
            pem::pack_key(&key).unwrap(),
            vector.packed,
            "vector {} ({}): pack mismatch",
            i,
            vector.comment
        );
        assert_eq!(
            pem::pack_key_folded(&key).unwrap(),
            vector.packed_folded,
            "vector {} ({}): folded pack mismatch",
            i,
            vector.comment
        );
        assert_eq!(
            pem::unpack_key(&vector.packed).unwrap(),
            key,
            "vector {} ({}): unpack mismatch",
            i,
            vector.comment
        );
        assert_eq!(
            pem::unpack_key(&vector.packed_folded).unwrap(),
            key,
            "vector {} ({}): folded unpack mismatch",
            i,
            vector.comment
        );
    }
}

#[test]
fn test_lowercase_markers_unpack() {
    let vectors = load_packing_vectors().expect("failed to load packing vectors");
    let vector = vectors
        .iter()
        .find(|v| v.key_type.as_deref() == Some("PRIVATE"))
        .expect("no private vector");
    let lowered = vector
        .packed
        .replace("BEGIN PRIVATE KEY", "begin private key")
        .replace("END PRIVATE KEY", "end Private key");

    let key = pem::unpack_key(&lowered).unwrap();
    assert_eq!(key.key_type, Some(KeyType::Private));
    assert_eq!(key, wrapped_key(vector).unwrap());
}

#[test]
fn test_codec_matches_base64_crate() {
    // Lengths around every padding case and the 76-character fold point.
    let data: Vec<u8> = (0..=255u8).cycle().take(300).collect();
    for len in [0usize, 1, 2, 3, 4, 5, 56, 57, 58, 59, 113, 114, 115, 300] {
        let bytes = &data[..len];
        let expected = BASE64_STANDARD.encode(bytes);

        let encoded = codec::encode(bytes, false);
        assert_eq!(encoded, expected, "length {}", len);
        assert_eq!(codec::decode(&expected).unwrap(), bytes, "length {}", len);

        let folded = codec::encode(bytes, true);
        assert_eq!(folded.replace("\r\n", ""), expected, "length {}", len);
        assert!(
            folded.split("\r\n").all(|line| line.len() <= codec::LINE_WIDTH),
            "length {}",
            len
        );
        assert_eq!(codec::decode(&folded).unwrap(), bytes, "length {}", len);
    }
}
