//! Shared token registry
//!
//! Centralizes mint addresses, decimals and lamport conversions so the swap,
//! chain and cycle modules agree on units.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Lamports per SOL
pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// Smallest buy the swap service will route; anything below is a config error
pub const MIN_BUY_LAMPORTS: u64 = 100_000;

/// Token metadata
#[derive(Debug, Clone, Copy)]
pub struct TokenInfo {
    /// Token symbol (e.g., "USDC", "SOL")
    pub symbol: &'static str,
    /// Number of decimals
    pub decimals: u8,
}

/// Well-known mint addresses
pub mod mints {
    /// Wrapped SOL; native SOL is swapped through this mint
    pub const WSOL: &str = "So11111111111111111111111111111111111111112";
    pub const USDC: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
    pub const USDT: &str = "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB";
}

/// Get the global token registry (lazily initialized)
pub fn registry() -> &'static HashMap<&'static str, TokenInfo> {
    static REGISTRY: OnceLock<HashMap<&'static str, TokenInfo>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map = HashMap::new();
        map.insert(
            mints::WSOL,
            TokenInfo {
                symbol: "SOL",
                decimals: 9,
            },
        );
        map.insert(
            mints::USDC,
            TokenInfo {
                symbol: "USDC",
                decimals: 6,
            },
        );
        map.insert(
            mints::USDT,
            TokenInfo {
                symbol: "USDT",
                decimals: 6,
            },
        );
        map
    })
}

/// Symbol for a mint, or a shortened address for unknown mints
pub fn display_symbol(mint: &str) -> String {
    match registry().get(mint) {
        Some(info) => info.symbol.to_string(),
        None if mint.len() > 8 => format!("{}..{}", &mint[..4], &mint[mint.len() - 4..]),
        None => mint.to_string(),
    }
}

/// Convert a SOL amount to lamports, rounding down
pub fn sol_to_lamports(sol: f64) -> u64 {
    if !sol.is_finite() || sol <= 0.0 {
        return 0;
    }
    (sol * LAMPORTS_PER_SOL as f64).floor() as u64
}

/// Convert lamports to SOL for display
pub fn lamports_to_sol(lamports: u64) -> f64 {
    lamports as f64 / LAMPORTS_PER_SOL as f64
}

/// Check that a string is a base58-encoded 32-byte public key or mint
pub fn is_valid_address(address: &str) -> bool {
    matches!(bs58::decode(address).into_vec(), Ok(bytes) if bytes.len() == 32)
}
