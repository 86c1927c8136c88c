use serde::{Deserialize, Serialize};

/// Asset class of a symbol. Providers use it to route to the right endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    #[default]
    UsEquity,
    Crypto,
    Futures,
}
