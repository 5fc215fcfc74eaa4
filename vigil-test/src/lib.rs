//! Shared test bootstrap for the vigil workspace.
//!
//! Every test starts with `vigil_test::init()`, which installs a tracing
//! subscriber (respecting `RUST_LOG`) and color-eyre panic reporting,
//! exactly once per process.

use once_cell::sync::OnceCell;
use tracing_error::ErrorLayer;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: OnceCell<()> = OnceCell::new();

/// Initialize tracing and error reporting for a test binary.
///
/// Idempotent; concurrent callers race harmlessly.
pub fn init() {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_test_writer())
            .with(ErrorLayer::default())
            .try_init();

        let _ = color_eyre::install();
    });
}

/// Decode a hex fixture, panicking with the offending string on failure.
pub fn hex_fixture(s: &str) -> Vec<u8> {
    hex::decode(s).unwrap_or_else(|e| panic!("bad hex fixture {:?}: {}", s, e))
}

lazy_static::lazy_static! {
    /// A minimal one-in one-out transaction, usable anywhere a well-formed
    /// raw tx is needed.
    pub static ref DUMMY_TX1: Vec<u8> = hex_fixture(
        // version 1, one input spending 0xaa..:0, empty script, final
        // sequence, one 50 BTC P2PKH output, locktime 0
        "0100000001aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa00000000\
         00ffffffff0100f2052a010000001976a914000000000000000000000000000000000000000088ac00\
         000000"
    );
}
