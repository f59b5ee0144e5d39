//! Card Decks
//!
//! Two decks of fixed cards. The game document only tracks how many cards are
//! left in each deck; the card drawn is chosen by the game's random source.

use serde::{Deserialize, Serialize};

use crate::game::state::{EffectKind, MarketCondition};

/// Card deck identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CardDeck {
    /// Mostly favorable cards.
    Opportunity,
    /// Mostly unfavorable cards.
    Scandal,
}

impl CardDeck {
    /// Every deck.
    pub const ALL: [CardDeck; 2] = [CardDeck::Opportunity, CardDeck::Scandal];

    /// Cards in this deck.
    pub fn cards(self) -> &'static [Card] {
        match self {
            CardDeck::Opportunity => OPPORTUNITY,
            CardDeck::Scandal => SCANDAL,
        }
    }

    /// Number of cards in a full deck.
    pub fn size(self) -> u32 {
        self.cards().len() as u32
    }
}

/// What a card does when drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "kebab-case")]
pub enum CardEffect {
    /// Bank pays the player.
    Collect { amount: i64 },
    /// Player pays the bank. Mandatory.
    Pay { amount: i64 },
    /// Advance to a position, collecting salary when passing start.
    AdvanceTo { position: u8 },
    /// Move backwards without passing start.
    MoveBack { spaces: u8 },
    /// Go directly to jail.
    GoToJail,
    /// Keep a card that skips the next jail stay.
    JailFree,
    /// Shift the market for every property.
    Market { condition: MarketCondition },
    /// Apply a timed rent effect to the drawer's most valuable property.
    PropertyEffect { kind: EffectKind, turns: u8 },
}

/// A single card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Card {
    /// Card identifier.
    pub id: &'static str,
    /// Text shown to players.
    pub text: &'static str,
    /// Effect applied on draw.
    pub effect: CardEffect,
}

const OPPORTUNITY: &[Card] = &[
    Card { id: "viral-post", text: "Your post went viral. Collect 150.", effect: CardEffect::Collect { amount: 150 } },
    Card { id: "brand-deal", text: "Brand deal signed. Collect 100.", effect: CardEffect::Collect { amount: 100 } },
    Card { id: "back-to-start", text: "Advance to Start.", effect: CardEffect::AdvanceTo { position: 0 } },
    Card { id: "verified-visit", text: "Advance to Verified Villa.", effect: CardEffect::AdvanceTo { position: 39 } },
    Card { id: "appeal-granted", text: "Appeal granted. Keep this card to skip jail.", effect: CardEffect::JailFree },
    Card { id: "bull-run", text: "Ad market booms. All rents rise.", effect: CardEffect::Market { condition: MarketCondition::Bull } },
    Card { id: "trending", text: "Your best property is trending for 3 turns.", effect: CardEffect::PropertyEffect { kind: EffectKind::Trending, turns: 3 } },
    Card { id: "creator-fund", text: "Creator fund payout. Collect 50.", effect: CardEffect::Collect { amount: 50 } },
];

const SCANDAL: &[Card] = &[
    Card { id: "leaked-dms", text: "Leaked DMs. Pay 100 in damage control.", effect: CardEffect::Pay { amount: 100 } },
    Card { id: "copyright-strike", text: "Copyright strike. Pay 50.", effect: CardEffect::Pay { amount: 50 } },
    Card { id: "shadowbanned", text: "Shadowbanned. Go directly to jail.", effect: CardEffect::GoToJail },
    Card { id: "unfollowed", text: "Mass unfollow. Move back 3 spaces.", effect: CardEffect::MoveBack { spaces: 3 } },
    Card { id: "bear-market", text: "Ad market slumps. All rents fall.", effect: CardEffect::Market { condition: MarketCondition::Bear } },
    Card { id: "cancelled", text: "Your best property is cancelled for 2 turns.", effect: CardEffect::PropertyEffect { kind: EffectKind::Cancelled, turns: 2 } },
    Card { id: "market-calm", text: "Markets settle down.", effect: CardEffect::Market { condition: MarketCondition::Stable } },
    Card { id: "server-bill", text: "Server bill due. Pay 150.", effect: CardEffect::Pay { amount: 150 } },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deck_sizes() {
        assert_eq!(CardDeck::Opportunity.size(), 8);
        assert_eq!(CardDeck::Scandal.size(), 8);
    }

    #[test]
    fn test_card_ids_unique() {
        let mut ids: Vec<&str> = CardDeck::ALL
            .iter()
            .flat_map(|d| d.cards().iter().map(|c| c.id))
            .collect();
        let total = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), total);
    }

    #[test]
    fn test_deck_serializes_kebab_case() {
        assert_eq!(serde_json::to_string(&CardDeck::Opportunity).unwrap(), "\"opportunity\"");
    }
}
