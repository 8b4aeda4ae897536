//! Payout item selection and rake.
//!
//! Matches the requested payout items against the agent's inventory and
//! withholds at most one item as rake. The rake item is the first matched
//! item (in descending price order) whose price falls strictly inside one
//! of eight percentage bands of the jackpot value.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::cmp::Ordering;
use tracing::debug;

use crate::types::{InventoryItem, Item};

/// Rake bands as (low, high) percent of jackpot value, highest first.
pub const RAKE_BANDS: [(u32, u32); 8] = [
    (9, 10),
    (8, 9),
    (7, 8),
    (6, 7),
    (5, 6),
    (4, 5),
    (3, 4),
    (2, 3),
];

/// Items to transfer plus the withheld rake item, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub items: Vec<InventoryItem>,
    /// Market hash name of the withheld item; empty when nothing was raked.
    pub rake: String,
}

impl Selection {
    pub fn has_rake(&self) -> bool {
        !self.rake.is_empty()
    }
}

/// Strip the characters the inventory listing escapes (`.`, `#`, `$`).
pub fn normalize_hash_name(name: &str) -> String {
    name.chars().filter(|c| !matches!(c, '.' | '#' | '$')).collect()
}

/// The band (percent range) a price falls strictly inside, if any.
pub fn rake_band(price: Decimal, jackpot_value: Decimal) -> Option<(u32, u32)> {
    let percent = jackpot_value / dec!(100);
    RAKE_BANDS.iter().copied().find(|&(low, high)| {
        price > percent * Decimal::from(low) && price < percent * Decimal::from(high)
    })
}

/// Sort requested items by market price, highest first. Unpriced items last.
pub fn sort_by_price_desc(items: &mut [Item]) {
    items.sort_by(|a, b| match (a.market_price, b.market_price) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

/// One-pass greedy selection. `requested` must already be sorted.
///
/// Each requested item takes the first inventory entry with the same
/// normalized name. Matched items leave the pool so no asset is sent twice;
/// the rake item stays in the pool.
pub fn select_payout(
    requested: &[Item],
    mut inventory: Vec<InventoryItem>,
    jackpot_value: Decimal,
) -> Selection {
    let mut selected = Vec::with_capacity(requested.len());
    let mut rake = String::new();

    for item in requested {
        let wanted = normalize_hash_name(&item.market_hash_name);
        let Some(index) = inventory
            .iter()
            .position(|held| normalize_hash_name(&held.market_hash_name) == wanted)
        else {
            debug!(item = %item.market_hash_name, "Requested item not in inventory");
            continue;
        };

        if rake.is_empty() {
            let band = item
                .market_price
                .and_then(|price| rake_band(price, jackpot_value));
            if let Some((low, high)) = band {
                debug!(item = %item.market_hash_name, low, high, "Withholding rake item");
                rake = item.market_hash_name.clone();
                continue;
            }
        }

        selected.push(inventory.remove(index));
    }

    Selection {
        items: selected,
        rake,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn requested(name: &str, price: Decimal) -> Item {
        Item {
            appid: 730,
            contextid: "2".into(),
            assetid: String::new(),
            amount: 1,
            market_hash_name: name.into(),
            market_price: Some(price),
            extra: serde_json::Map::new(),
        }
    }

    fn held(asset: &str, name: &str) -> InventoryItem {
        InventoryItem {
            assetid: asset.into(),
            appid: 730,
            contextid: "2".into(),
            amount: 1,
            market_hash_name: name.into(),
            tradable: true,
        }
    }

    #[test]
    fn test_normalize_hash_name() {
        assert_eq!(normalize_hash_name("Sticker | Team Dignitas (Holo) | Katowice 2014"), "Sticker | Team Dignitas (Holo) | Katowice 2014");
        assert_eq!(normalize_hash_name("M4A4 | Howl #1.$"), "M4A4 | Howl 1");
    }

    #[test]
    fn test_rake_band_boundaries_are_exclusive() {
        let v = dec!(1000);
        assert_eq!(rake_band(dec!(95), v), Some((9, 10)));
        assert_eq!(rake_band(dec!(90), v), None);
        assert_eq!(rake_band(dec!(100), v), None);
        assert_eq!(rake_band(dec!(50), v), None);
        assert_eq!(rake_band(dec!(20), v), None);
        assert_eq!(rake_band(dec!(25), v), Some((2, 3)));
        assert_eq!(rake_band(dec!(150), v), None);
        assert_eq!(rake_band(dec!(5), v), None);
    }

    #[test]
    fn test_worked_example_1000() {
        let mut items = vec![
            requested("Knife", dec!(95)),
            requested("Rifle", dec!(50)),
            requested("Pistol", dec!(20)),
        ];
        sort_by_price_desc(&mut items);
        let inventory = vec![held("a", "Pistol"), held("b", "Knife"), held("c", "Rifle")];

        let selection = select_payout(&items, inventory, dec!(1000));
        assert_eq!(selection.rake, "Knife");
        let assets: Vec<_> = selection.items.iter().map(|i| i.assetid.as_str()).collect();
        assert_eq!(assets, vec!["c", "a"]);
    }

    #[test]
    fn test_only_one_rake_item() {
        // Both 95 and 85 sit in a band; only the first matched is withheld.
        let items = vec![requested("A", dec!(95)), requested("B", dec!(85))];
        let inventory = vec![held("1", "A"), held("2", "B")];
        let selection = select_payout(&items, inventory, dec!(1000));
        assert_eq!(selection.rake, "A");
        assert_eq!(selection.items.len(), 1);
        assert_eq!(selection.items[0].assetid, "2");
    }

    #[test]
    fn test_no_band_match_sends_everything() {
        let items = vec![requested("A", dec!(500)), requested("B", dec!(500))];
        let inventory = vec![held("1", "A"), held("2", "B")];
        let selection = select_payout(&items, inventory, dec!(1000));
        assert!(!selection.has_rake());
        assert_eq!(selection.items.len(), 2);
    }

    #[test]
    fn test_duplicate_names_take_distinct_assets() {
        let items = vec![requested("Case", dec!(1)), requested("Case", dec!(1))];
        let inventory = vec![held("1", "Case"), held("2", "Case"), held("3", "Case")];
        let selection = select_payout(&items, inventory, dec!(1000));
        let assets: Vec<_> = selection.items.iter().map(|i| i.assetid.as_str()).collect();
        assert_eq!(assets, vec!["1", "2"]);
    }

    #[test]
    fn test_escaped_inventory_names_match() {
        let items = vec![requested("StatTrak M4A1-S  Hyper Beast", dec!(10))];
        let inventory = vec![held("9", "StatTrak. M4A1-S # Hyper Beast")];
        let selection = select_payout(&items, inventory, dec!(10_000));
        assert_eq!(selection.items.len(), 1);
    }

    #[test]
    fn test_missing_inventory_item_is_skipped() {
        let items = vec![requested("Gone", dec!(95)), requested("Here", dec!(30))];
        let inventory = vec![held("1", "Here")];
        let selection = select_payout(&items, inventory, dec!(1000));
        // 30 is 3% exactly: not a band, and "Gone" never matched so no rake.
        assert!(!selection.has_rake());
        assert_eq!(selection.items.len(), 1);
    }

    #[test]
    fn test_unpriced_items_sort_last_and_never_rake() {
        let mut items = vec![
            Item {
                market_price: None,
                ..requested("Unpriced", dec!(0))
            },
            requested("Priced", dec!(95)),
        ];
        sort_by_price_desc(&mut items);
        assert_eq!(items[0].market_hash_name, "Priced");

        let inventory = vec![held("1", "Unpriced")];
        let selection = select_payout(&items[1..], inventory, dec!(1000));
        assert!(!selection.has_rake());
        assert_eq!(selection.items.len(), 1);
    }

    #[test]
    fn test_rake_price_always_inside_a_band() {
        let jackpot = dec!(777.77);
        let prices = [dec!(300), dec!(70.5), dec!(41), dec!(15.55), dec!(3)];
        let items: Vec<Item> = prices
            .iter()
            .enumerate()
            .map(|(i, p)| requested(&format!("I{i}"), *p))
            .collect();
        let inventory: Vec<InventoryItem> =
            (0..prices.len()).map(|i| held(&i.to_string(), &format!("I{i}"))).collect();

        let selection = select_payout(&items, inventory, jackpot);
        let raked = items.iter().find(|i| i.market_hash_name == selection.rake).unwrap();
        assert!(rake_band(raked.market_price.unwrap(), jackpot).is_some());
        assert_eq!(selection.items.len(), prices.len() - 1);
    }
}
