//! Cost accounting — pure mapping from model id and token counts to USD.
//!
//! Session totals are always derived by summing RunMetrics, never stored
//! on the session row.

/// Per-1k-token prices for a model, in USD.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub in_per_1k: f64,
    pub out_per_1k: f64,
}

/// Price applied to models missing from the table.
pub const DEFAULT_PRICE: ModelPrice = ModelPrice {
    in_per_1k: 0.002,
    out_per_1k: 0.006,
};

/// Static price table for the default agent models and close relatives.
const PRICES: &[(&str, ModelPrice)] = &[
    (
        "gpt-4o",
        ModelPrice {
            in_per_1k: 0.0025,
            out_per_1k: 0.01,
        },
    ),
    (
        "gpt-4o-mini",
        ModelPrice {
            in_per_1k: 0.00015,
            out_per_1k: 0.0006,
        },
    ),
    (
        "claude-sonnet-4",
        ModelPrice {
            in_per_1k: 0.003,
            out_per_1k: 0.015,
        },
    ),
    (
        "claude-haiku-3-5",
        ModelPrice {
            in_per_1k: 0.0008,
            out_per_1k: 0.004,
        },
    ),
    (
        "gemini-2.5-pro",
        ModelPrice {
            in_per_1k: 0.00125,
            out_per_1k: 0.01,
        },
    ),
    (
        "gemini-2.5-flash",
        ModelPrice {
            in_per_1k: 0.0003,
            out_per_1k: 0.0025,
        },
    ),
    (
        "deepseek-chat",
        ModelPrice {
            in_per_1k: 0.00027,
            out_per_1k: 0.0011,
        },
    ),
];

/// Look up the price for a model; `None` when the model is unknown.
pub fn price(model_id: &str) -> Option<ModelPrice> {
    PRICES
        .iter()
        .find(|(id, _)| *id == model_id)
        .map(|(_, p)| *p)
}

/// Price for a model, falling back to [`DEFAULT_PRICE`] with a warning.
pub fn price_or_default(model_id: &str) -> (ModelPrice, bool) {
    match price(model_id) {
        Some(p) => (p, false),
        None => {
            tracing::warn!(model = model_id, "unknown model price, using default");
            (DEFAULT_PRICE, true)
        }
    }
}

/// Round to 6 decimal places (micro-dollar precision).
fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

/// Cost of a single call in USD, rounded to 6 decimal places.
pub fn call_cost(price: ModelPrice, tokens_in: u32, tokens_out: u32) -> f64 {
    round6(
        tokens_in as f64 / 1000.0 * price.in_per_1k
            + tokens_out as f64 / 1000.0 * price.out_per_1k,
    )
}
