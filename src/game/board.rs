//! Board Layout
//!
//! Static description of the 40-space board: which space is what, and the
//! purchase/rent numbers for every property. Mutable ownership lives in
//! [`crate::game::state::BoardState`]; this module never changes at runtime.

use serde::{Deserialize, Serialize};

use crate::game::cards::CardDeck;

/// Number of spaces on the board.
pub const BOARD_SIZE: u8 = 40;

/// Salary for passing or landing on the start space.
pub const START_SALARY: i64 = 200;

/// Jail space index.
pub const JAIL_POSITION: u8 = 10;

/// Fine to leave jail after the last jail turn.
pub const JAIL_FINE: i64 = 50;

/// Turns a player stays in jail before the fine becomes mandatory.
pub const JAIL_TURNS: u8 = 3;

/// Highest engagement level before the checkmark.
pub const MAX_ENGAGEMENTS: u8 = 4;

/// Rent multiplier (percent of base) indexed by build level.
/// Level 5 is the checkmark.
pub const BUILD_RENT_PCT: [i64; 6] = [100, 500, 1500, 4500, 6200, 7500];

/// What occupies a board space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Space {
    /// Start space; salary is paid on pass.
    Start,
    /// Purchasable property.
    Property {
        /// Property identifier.
        id: String,
    },
    /// Flat tax payable to the bank.
    Tax {
        /// Amount due.
        amount: i64,
    },
    /// Draw from a card deck.
    Card {
        /// Deck to draw from.
        deck: CardDeck,
    },
    /// Jail (just visiting unless jailed).
    Jail,
    /// Sends the player to jail.
    GoToJail,
    /// Nothing happens.
    FreeParking,
}

/// Static property definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertySpec {
    /// Property identifier.
    pub id: &'static str,
    /// Display name.
    pub name: &'static str,
    /// Color group.
    pub group: &'static str,
    /// Board position.
    pub position: u8,
    /// Purchase price.
    pub price: i64,
    /// Base rent.
    pub rent_base: i64,
}

/// Groups that can never be built on.
const UNBUILDABLE_GROUPS: [&str; 2] = ["network", "platform"];

const PROPERTIES: &[PropertySpec] = &[
    PropertySpec { id: "meme-alley", name: "Meme Alley", group: "starter", position: 1, price: 60, rent_base: 2 },
    PropertySpec { id: "lurker-lane", name: "Lurker Lane", group: "starter", position: 3, price: 60, rent_base: 4 },
    PropertySpec { id: "dial-up-station", name: "Dial-Up Station", group: "network", position: 5, price: 200, rent_base: 25 },
    PropertySpec { id: "hashtag-row", name: "Hashtag Row", group: "niche", position: 6, price: 100, rent_base: 6 },
    PropertySpec { id: "emoji-court", name: "Emoji Court", group: "niche", position: 8, price: 100, rent_base: 6 },
    PropertySpec { id: "gif-garden", name: "GIF Garden", group: "niche", position: 9, price: 120, rent_base: 8 },
    PropertySpec { id: "selfie-square", name: "Selfie Square", group: "lifestyle", position: 11, price: 140, rent_base: 10 },
    PropertySpec { id: "cloud-utility", name: "Cloud Utility", group: "platform", position: 12, price: 150, rent_base: 12 },
    PropertySpec { id: "brunch-boulevard", name: "Brunch Boulevard", group: "lifestyle", position: 13, price: 140, rent_base: 10 },
    PropertySpec { id: "wellness-way", name: "Wellness Way", group: "lifestyle", position: 14, price: 160, rent_base: 12 },
    PropertySpec { id: "broadband-station", name: "Broadband Station", group: "network", position: 15, price: 200, rent_base: 25 },
    PropertySpec { id: "speedrun-street", name: "Speedrun Street", group: "gaming", position: 16, price: 180, rent_base: 14 },
    PropertySpec { id: "lootbox-lane", name: "Lootbox Lane", group: "gaming", position: 18, price: 180, rent_base: 14 },
    PropertySpec { id: "esports-arena", name: "Esports Arena", group: "gaming", position: 19, price: 200, rent_base: 16 },
    PropertySpec { id: "playlist-plaza", name: "Playlist Plaza", group: "music", position: 21, price: 220, rent_base: 18 },
    PropertySpec { id: "remix-road", name: "Remix Road", group: "music", position: 23, price: 220, rent_base: 18 },
    PropertySpec { id: "festival-fields", name: "Festival Fields", group: "music", position: 24, price: 240, rent_base: 20 },
    PropertySpec { id: "fiber-station", name: "Fiber Station", group: "network", position: 25, price: 200, rent_base: 25 },
    PropertySpec { id: "runway-row", name: "Runway Row", group: "fashion", position: 26, price: 260, rent_base: 22 },
    PropertySpec { id: "haul-heights", name: "Haul Heights", group: "fashion", position: 27, price: 260, rent_base: 22 },
    PropertySpec { id: "stream-utility", name: "Stream Utility", group: "platform", position: 28, price: 150, rent_base: 12 },
    PropertySpec { id: "drop-district", name: "Drop District", group: "fashion", position: 29, price: 280, rent_base: 24 },
    PropertySpec { id: "startup-strip", name: "Startup Strip", group: "tech", position: 31, price: 300, rent_base: 26 },
    PropertySpec { id: "unicorn-avenue", name: "Unicorn Avenue", group: "tech", position: 32, price: 300, rent_base: 26 },
    PropertySpec { id: "ipo-place", name: "IPO Place", group: "tech", position: 34, price: 320, rent_base: 28 },
    PropertySpec { id: "satellite-station", name: "Satellite Station", group: "network", position: 35, price: 200, rent_base: 25 },
    PropertySpec { id: "influencer-estate", name: "Influencer Estate", group: "celebrity", position: 37, price: 350, rent_base: 35 },
    PropertySpec { id: "verified-villa", name: "Verified Villa", group: "celebrity", position: 39, price: 400, rent_base: 50 },
];

/// The full board.
#[derive(Debug, Clone)]
pub struct BoardLayout {
    spaces: Vec<Space>,
}

impl Default for BoardLayout {
    fn default() -> Self {
        Self::standard()
    }
}

impl BoardLayout {
    /// The standard 40-space board.
    pub fn standard() -> Self {
        let mut spaces = vec![Space::FreeParking; BOARD_SIZE as usize];
        spaces[0] = Space::Start;
        spaces[JAIL_POSITION as usize] = Space::Jail;
        spaces[30] = Space::GoToJail;
        spaces[20] = Space::FreeParking;
        spaces[4] = Space::Tax { amount: 200 };
        spaces[38] = Space::Tax { amount: 100 };
        for pos in [2usize, 17, 33] {
            spaces[pos] = Space::Card { deck: CardDeck::Opportunity };
        }
        for pos in [7usize, 22, 36] {
            spaces[pos] = Space::Card { deck: CardDeck::Scandal };
        }
        for spec in PROPERTIES {
            spaces[spec.position as usize] = Space::Property { id: spec.id.to_string() };
        }
        Self { spaces }
    }

    /// Number of spaces.
    pub fn len(&self) -> u8 {
        self.spaces.len() as u8
    }

    /// Boards are never empty.
    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
    }

    /// Space at a position (wrapping).
    pub fn space(&self, position: u8) -> &Space {
        &self.spaces[position as usize % self.spaces.len()]
    }

    /// All property definitions.
    pub fn properties(&self) -> &'static [PropertySpec] {
        PROPERTIES
    }

    /// Look up a property definition.
    pub fn property(&self, id: &str) -> Option<&'static PropertySpec> {
        PROPERTIES.iter().find(|p| p.id == id)
    }

    /// Ids of every property in a group.
    pub fn group_members(&self, group: &str) -> Vec<&'static str> {
        PROPERTIES
            .iter()
            .filter(|p| p.group == group)
            .map(|p| p.id)
            .collect()
    }

    /// Whether engagements can be built in this group.
    pub fn is_buildable(&self, group: &str) -> bool {
        !UNBUILDABLE_GROUPS.contains(&group)
    }

    /// Position of a property, if it exists.
    pub fn position_of(&self, id: &str) -> Option<u8> {
        self.property(id).map(|p| p.position)
    }
}

/// Mortgage payout for a property.
pub fn mortgage_value(price: i64) -> i64 {
    price / 2
}

/// Cost to lift a mortgage (value plus 10% interest).
pub fn unmortgage_cost(price: i64) -> i64 {
    let value = mortgage_value(price);
    value + value / 10
}

/// Cost of one build level.
pub fn build_cost(price: i64) -> i64 {
    price / 2
}
