//! End-to-end suite for the shared UART transport.

#[cfg(all(test, not(target_arch = "wasm32")))]
mod native_e2e;
