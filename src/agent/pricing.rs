/// Per-million-token prices in USD.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Price {
    pub input: f64,
    pub output: f64,
}

/// Lookup is first-substring-match over this table, so order is a contract:
/// more specific names must come before names they contain (`gpt-4o-mini`
/// before `gpt-4o`, `gpt-4-turbo` before `gpt-4`), otherwise a cheaper tier
/// silently bills at the bigger model's rate.
const PRICING: &[(&str, Price)] = &[
    // Anthropic
    ("claude-3-5-sonnet", Price { input: 3.0, output: 15.0 }),
    ("claude-sonnet-4", Price { input: 3.0, output: 15.0 }),
    ("claude-3-5-haiku", Price { input: 0.25, output: 1.25 }),
    ("claude-3-opus", Price { input: 15.0, output: 75.0 }),
    ("claude-3-haiku", Price { input: 0.25, output: 1.25 }),
    // OpenAI
    ("gpt-4o-mini", Price { input: 0.15, output: 0.6 }),
    ("gpt-4o", Price { input: 2.5, output: 10.0 }),
    ("gpt-4-turbo", Price { input: 10.0, output: 30.0 }),
    ("gpt-3.5-turbo", Price { input: 0.5, output: 1.5 }),
    ("gpt-4", Price { input: 30.0, output: 60.0 }),
    ("o4-mini", Price { input: 1.1, output: 4.4 }),
    ("o3", Price { input: 10.0, output: 40.0 }),
];

/// Mid-tier (sonnet) pricing for models the table does not know.
const DEFAULT_PRICE: Price = Price { input: 3.0, output: 15.0 };

/// Same-provider cheaper-tier suggestions, same ordered-substring policy.
const DOWNGRADES: &[(&str, &str)] = &[
    // Anthropic
    ("claude-opus-4", "claude-sonnet-4"),
    ("claude-sonnet-4", "claude-3-5-haiku"),
    ("claude-3-opus", "claude-3-5-sonnet"),
    ("claude-3-5-sonnet", "claude-3-5-haiku"),
    // OpenAI
    ("gpt-4o", "gpt-4o-mini"),
    ("gpt-4-turbo", "gpt-4o-mini"),
    ("o3", "o4-mini"),
];

pub fn price(model: &str) -> Price {
    for (key, p) in PRICING {
        if model.contains(key) {
            return *p;
        }
    }
    DEFAULT_PRICE
}

pub fn estimate_cost(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let p = price(model);
    (input_tokens as f64 * p.input + output_tokens as f64 * p.output) / 1_000_000.0
}

/// Cheaper same-provider model, or `None` when the table has no entry or the
/// model already names the cheaper tier (a `gpt-4o-mini` request matches the
/// `gpt-4o` entry but must not be told to downgrade to itself).
pub fn suggest_downgrade(model: &str) -> Option<&'static str> {
    for (key, cheaper) in DOWNGRADES {
        if model.contains(key) && !model.contains(cheaper) {
            return Some(cheaper);
        }
    }
    None
}
