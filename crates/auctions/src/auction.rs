//! The auction system-of-record entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bidbus_core::{AggregateId, DomainError, DomainResult};

use crate::contracts::{AuctionCreated, AuctionUpdated};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuctionStatus {
    Live,
    Finished,
    ReserveNotMet,
}

impl AuctionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "Live",
            Self::Finished => "Finished",
            Self::ReserveNotMet => "ReserveNotMet",
        }
    }
}

/// The car being sold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub make: String,
    pub model: String,
    pub year: i32,
    pub color: String,
    pub mileage: i32,
    pub image_url: String,
}

/// Input for opening an auction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAuction {
    pub make: String,
    pub model: String,
    pub year: i32,
    pub color: String,
    pub mileage: i32,
    pub image_url: String,
    pub reserve_price: i32,
    pub auction_end: DateTime<Utc>,
}

/// Partial edit of the item; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuctionChanges {
    pub make: Option<String>,
    pub model: Option<String>,
    pub year: Option<i32>,
    pub color: Option<String>,
    pub mileage: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auction {
    pub id: AggregateId,
    pub reserve_price: i32,
    pub seller: String,
    pub winner: Option<String>,
    pub sold_amount: Option<i32>,
    pub current_high_bid: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub auction_end: DateTime<Utc>,
    pub status: AuctionStatus,
    pub item: Item,
}

fn require(field: &str, value: &str) -> DomainResult<()> {
    if value.trim().is_empty() {
        return Err(DomainError::validation(format!("{field} is required")));
    }
    Ok(())
}

fn non_negative(field: &str, value: i32) -> DomainResult<()> {
    if value < 0 {
        return Err(DomainError::validation(format!("{field} must not be negative")));
    }
    Ok(())
}

impl Auction {
    /// Validate `new` and open a live auction for `seller`.
    pub fn open(
        id: AggregateId,
        seller: &str,
        new: NewAuction,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        require("seller", seller)?;
        require("make", &new.make)?;
        require("model", &new.model)?;
        require("color", &new.color)?;
        require("imageUrl", &new.image_url)?;
        non_negative("mileage", new.mileage)?;
        non_negative("reservePrice", new.reserve_price)?;
        if new.auction_end <= now {
            return Err(DomainError::validation("auctionEnd must be in the future"));
        }

        Ok(Self {
            id,
            reserve_price: new.reserve_price,
            seller: seller.to_string(),
            winner: None,
            sold_amount: None,
            current_high_bid: None,
            created_at: now,
            updated_at: now,
            auction_end: new.auction_end,
            status: AuctionStatus::Live,
            item: Item {
                make: new.make,
                model: new.model,
                year: new.year,
                color: new.color,
                mileage: new.mileage,
                image_url: new.image_url,
            },
        })
    }

    /// Only the seller may edit or withdraw an auction.
    pub fn ensure_seller(&self, user: &str) -> DomainResult<()> {
        if self.seller != user {
            return Err(DomainError::Unauthorized);
        }
        Ok(())
    }

    pub fn apply_changes(&mut self, changes: AuctionChanges, now: DateTime<Utc>) -> DomainResult<()> {
        if let Some(make) = &changes.make {
            require("make", make)?;
        }
        if let Some(model) = &changes.model {
            require("model", model)?;
        }
        if let Some(color) = &changes.color {
            require("color", color)?;
        }
        if let Some(mileage) = changes.mileage {
            non_negative("mileage", mileage)?;
        }

        let item = &mut self.item;
        if let Some(make) = changes.make {
            item.make = make;
        }
        if let Some(model) = changes.model {
            item.model = model;
        }
        if let Some(year) = changes.year {
            item.year = year;
        }
        if let Some(color) = changes.color {
            item.color = color;
        }
        if let Some(mileage) = changes.mileage {
            item.mileage = mileage;
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn to_created(&self) -> AuctionCreated {
        AuctionCreated {
            id: self.id,
            reserve_price: self.reserve_price,
            seller: self.seller.clone(),
            winner: self.winner.clone(),
            sold_amount: self.sold_amount,
            current_high_bid: self.current_high_bid,
            created_at: self.created_at,
            updated_at: self.updated_at,
            auction_end: self.auction_end,
            status: self.status.as_str().to_string(),
            make: self.item.make.clone(),
            model: self.item.model.clone(),
            year: self.item.year,
            color: self.item.color.clone(),
            mileage: self.item.mileage,
            image_url: self.item.image_url.clone(),
        }
    }

    /// Full item snapshot as an update event.
    pub fn to_updated(&self) -> AuctionUpdated {
        AuctionUpdated {
            id: self.id,
            make: Some(self.item.make.clone()),
            model: Some(self.item.model.clone()),
            year: Some(self.item.year),
            color: Some(self.item.color.clone()),
            mileage: Some(self.item.mileage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn new_auction(model: &str) -> NewAuction {
        NewAuction {
            make: "Ford".into(),
            model: model.into(),
            year: 2020,
            color: "White".into(),
            mileage: 50_000,
            image_url: "https://example.invalid/car.jpg".into(),
            reserve_price: 20_000,
            auction_end: Utc::now() + Duration::days(10),
        }
    }

    #[test]
    fn open_creates_live_auction() {
        let auction = Auction::open(AggregateId::new(), "bob", new_auction("GT"), Utc::now()).unwrap();
        assert_eq!(auction.status, AuctionStatus::Live);
        assert_eq!(auction.to_created().status, "Live");
        assert_eq!(auction.to_created().model, "GT");
    }

    #[test]
    fn open_rejects_missing_fields() {
        let mut new = new_auction("GT");
        new.make = " ".into();
        assert!(matches!(
            Auction::open(AggregateId::new(), "bob", new, Utc::now()),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn open_rejects_past_end() {
        let mut new = new_auction("GT");
        new.auction_end = Utc::now() - Duration::days(1);
        assert!(Auction::open(AggregateId::new(), "bob", new, Utc::now()).is_err());
    }

    #[test]
    fn only_seller_may_edit() {
        let auction = Auction::open(AggregateId::new(), "bob", new_auction("GT"), Utc::now()).unwrap();
        assert!(auction.ensure_seller("bob").is_ok());
        assert_eq!(auction.ensure_seller("alice"), Err(DomainError::Unauthorized));
    }

    #[test]
    fn invalid_change_leaves_auction_untouched() {
        let mut auction = Auction::open(AggregateId::new(), "bob", new_auction("GT"), Utc::now()).unwrap();
        let before = auction.clone();
        let changes = AuctionChanges {
            color: Some("Red".into()),
            mileage: Some(-1),
            ..Default::default()
        };
        assert!(auction.apply_changes(changes, Utc::now()).is_err());
        assert_eq!(auction, before);
    }

    proptest! {
        #[test]
        fn absent_fields_keep_current_values(
            year in proptest::option::of(1950i32..2030),
            mileage in proptest::option::of(0i32..500_000),
        ) {
            let mut auction = Auction::open(AggregateId::new(), "bob", new_auction("GT"), Utc::now()).unwrap();
            let before = auction.item.clone();
            let changes = AuctionChanges { year, mileage, ..Default::default() };
            auction.apply_changes(changes, Utc::now()).unwrap();

            prop_assert_eq!(&auction.item.make, &before.make);
            prop_assert_eq!(&auction.item.model, &before.model);
            prop_assert_eq!(auction.item.year, year.unwrap_or(before.year));
            prop_assert_eq!(auction.item.mileage, mileage.unwrap_or(before.mileage));
        }
    }
}
