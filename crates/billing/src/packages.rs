//! Top-up credit package catalog
//!
//! Fixed SKUs of purchased message credits. Purchased credits land in the
//! wallet's extra bucket and never expire.

use serde::{Deserialize, Serialize};

/// A purchasable block of extra message credits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditPackage {
    /// 100 messages
    Msg100,
    /// 500 messages
    Msg500,
    /// 1000 messages
    Msg1000,
}

impl CreditPackage {
    /// All purchasable packages
    pub fn all() -> Vec<Self> {
        vec![Self::Msg100, Self::Msg500, Self::Msg1000]
    }

    /// Catalog id as used in checkout external references
    pub fn id(&self) -> &'static str {
        match self {
            Self::Msg100 => "msg100",
            Self::Msg500 => "msg500",
            Self::Msg1000 => "msg1000",
        }
    }

    /// Resolve a catalog id
    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "msg100" => Some(Self::Msg100),
            "msg500" => Some(Self::Msg500),
            "msg1000" => Some(Self::Msg1000),
            _ => None,
        }
    }

    /// Message credits granted
    pub fn messages(&self) -> i32 {
        match self {
            Self::Msg100 => 100,
            Self::Msg500 => 500,
            Self::Msg1000 => 1_000,
        }
    }

    /// Price in cents (BRL)
    pub fn price_cents(&self) -> i64 {
        match self {
            Self::Msg100 => 990,
            Self::Msg500 => 3_990,
            Self::Msg1000 => 6_990,
        }
    }

    /// Human-readable name (pt-BR, shown at checkout)
    pub fn title(&self) -> String {
        format!("Pacote de {} mensagens", self.messages())
    }
}

impl std::fmt::Display for CreditPackage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}
