#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Parse errors and validation errors are both fine; panics are not.
    let Ok(cfg) = froth_config::load_toml(data) else {
        return;
    };
    if cfg.validate().is_ok() {
        // A validated config must map onto the runtime config without panicking
        let core = froth_core::FrothCfg::from(&cfg);
        assert!(core.pipeline.sense_rate_hz > 0.0);
        assert!(core.safety.watchdog_timeout.as_millis() > 0);
    }
});
