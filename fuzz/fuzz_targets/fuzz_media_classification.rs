#![no_main]

use libfuzzer_sys::fuzz_target;

use mediagate::media::{
    ContentNormalizer, FormatPolicy, MediaKind, NormalizeConfig, FALLBACK_MIME_TYPE,
};

fuzz_target!(|data: &[u8]| {
    let policy = FormatPolicy::new(
        1024 * 1024,
        vec!["image/".into(), "audio/".into(), "video/".into()],
    );

    let Ok(classification) = policy.validate(data, Some(data.len() as u64)) else {
        return;
    };
    assert_ne!(classification.mime_type, FALLBACK_MIME_TYPE);

    // Small bounds and a tight allocation limit keep each run cheap. Decoding
    // arbitrary bytes may fail but must not panic.
    let normalizer = ContentNormalizer::new(
        NormalizeConfig::default()
            .with_bounds(64, 64)
            .with_max_decode_alloc(16 * 1024 * 1024),
    );
    if let Ok(normalized) = normalizer.normalize(data.to_vec(), &classification) {
        if classification.kind != MediaKind::Image {
            assert_eq!(normalized.bytes, data);
        }
    }
});
