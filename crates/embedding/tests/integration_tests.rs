//! Integration smoke tests for the embedding crate.

use embedding::positional::rope::RopeConfig;

#[test]
fn positional_module_exposes_defaults() {
    let config = RopeConfig::default();
    assert_eq!(config.head_dim, 0);
    assert_eq!(config.rope_theta, 10_000.0);
    assert_eq!(config.rotate_dim, None);
    assert!(config.validate().is_err());
}

#[test]
fn root_reexports_cover_rope_entry_points() {
    let cfg = embedding::RopeConfig::new(64);
    assert_eq!(cfg.effective_rotate_dim(), 64);
    let (sin, cos) =
        embedding::sin_cos_tables(8, &cfg, &candle_core::Device::Cpu).expect("tables build");
    assert_eq!(sin.dims(), &[8, 32]);
    assert_eq!(cos.dims(), &[8, 32]);
}
