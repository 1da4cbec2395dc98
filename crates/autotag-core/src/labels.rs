//! Closed label vocabularies for the two tagging dimensions.
//!
//! A ticket is tagged with a service type (the product the conversation is
//! about) and a category (the intent within that product). Both sides come
//! from fixed enumerations; [`LabelPair::is_coherent`] checks a pair against
//! the allowed-combinations table.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::LabelError;

/// Top-level product a conversation concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    Flight,
    Hotel,
    Visa,
    Esim,
    Wallet,
    /// Placeholder: always forms a coherent pair.
    Other,
}

impl ServiceType {
    pub const ALL: [ServiceType; 6] = [
        Self::Flight,
        Self::Hotel,
        Self::Visa,
        Self::Esim,
        Self::Wallet,
        Self::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flight => "flight",
            Self::Hotel => "hotel",
            Self::Visa => "visa",
            Self::Esim => "esim",
            Self::Wallet => "wallet",
            Self::Other => "other",
        }
    }
}

/// Intent within a service type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Cancellation,
    Modify,
    TopUp,
    Withdraw,
    OrderRecheck,
    PrePurchase,
    /// Placeholder: always forms a coherent pair.
    Others,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Self::Cancellation,
        Self::Modify,
        Self::TopUp,
        Self::Withdraw,
        Self::OrderRecheck,
        Self::PrePurchase,
        Self::Others,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancellation => "cancellation",
            Self::Modify => "modify",
            Self::TopUp => "top_up",
            Self::Withdraw => "withdraw",
            Self::OrderRecheck => "order_recheck",
            Self::PrePurchase => "pre_purchase",
            Self::Others => "others",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| LabelError::UnknownServiceType(s.to_string()))
    }
}

impl FromStr for Category {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| LabelError::UnknownCategory(s.to_string()))
    }
}

/// Service/category combinations that make sense together.
pub const ALLOWED_PAIRS: &[(ServiceType, Category)] = &[
    (ServiceType::Flight, Category::Cancellation),
    (ServiceType::Flight, Category::Modify),
    (ServiceType::Flight, Category::OrderRecheck),
    (ServiceType::Hotel, Category::Modify),
    (ServiceType::Hotel, Category::Cancellation),
    (ServiceType::Visa, Category::PrePurchase),
    (ServiceType::Wallet, Category::TopUp),
    (ServiceType::Wallet, Category::Withdraw),
    (ServiceType::Wallet, Category::Cancellation),
    (ServiceType::Esim, Category::PrePurchase),
];

/// A (service type, category) tag. Either side may be unset until the
/// first decision lands on a ticket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelPair {
    pub service_type: Option<ServiceType>,
    pub category: Option<Category>,
}

impl LabelPair {
    pub fn new(service_type: ServiceType, category: Category) -> Self {
        Self {
            service_type: Some(service_type),
            category: Some(category),
        }
    }

    /// Whether the pair is semantically coherent.
    ///
    /// Unset sides and the `other`/`others` placeholders are always coherent;
    /// everything else must appear in [`ALLOWED_PAIRS`].
    pub fn is_coherent(&self) -> bool {
        match (self.service_type, self.category) {
            (None, _) | (_, None) => true,
            (Some(ServiceType::Other), _) | (_, Some(Category::Others)) => true,
            (Some(svc), Some(cat)) => ALLOWED_PAIRS.contains(&(svc, cat)),
        }
    }
}

impl fmt::Display for LabelPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let svc = self.service_type.map_or("unknown", |s| s.as_str());
        let cat = self.category.map_or("unknown", |c| c.as_str());
        write!(f, "{svc}::{cat}")
    }
}
