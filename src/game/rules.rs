//! Turn Engine Rules
//!
//! Pure functions that validate and apply one player action to a [`Game`].
//! Nothing here touches I/O: the manager clones the document, runs a rule,
//! persists the clone and only then swaps it in. A rule that returns `Err`
//! must leave the document logically unchanged.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::ids::{PlayerId, UserId};
use crate::core::rng::RandomSource;
use crate::game::board::{
    build_cost, mortgage_value, unmortgage_cost, BoardLayout, Space, JAIL_FINE,
    JAIL_POSITION, JAIL_TURNS, MAX_ENGAGEMENTS, START_SALARY,
};
use crate::game::cards::CardEffect;
use crate::game::events::{EventLog, GameEventData, JailReason};
use crate::game::state::{
    Game, GameStatus, Player, PlayerStatus, PropertyEffect, TradeOffer, TurnPhase, TurnState,
};

/// Economic constants for a game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulesConfig {
    /// Cash each player starts with.
    pub starting_balance: i64,
    /// Salary for passing start.
    pub start_salary: i64,
    /// Fine after the last jail turn.
    pub jail_fine: i64,
    /// Turns spent in jail.
    pub jail_turns: u8,
    /// Consecutive doubles that send a player to jail.
    pub max_consecutive_doubles: u8,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            starting_balance: 1500,
            start_salary: START_SALARY,
            jail_fine: JAIL_FINE,
            jail_turns: JAIL_TURNS,
            max_consecutive_doubles: 3,
        }
    }
}

/// Rule violations. Returned synchronously to the acting client, never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    /// Game status does not allow the action.
    #[error("game is {actual:?}, expected {expected:?}")]
    WrongStatus {
        /// Required status.
        expected: GameStatus,
        /// Actual status.
        actual: GameStatus,
    },
    /// Illegal status change.
    #[error("cannot move game from {from:?} to {to:?}")]
    InvalidTransition {
        /// Current status.
        from: GameStatus,
        /// Requested status.
        to: GameStatus,
    },
    /// Game configuration out of bounds.
    #[error("invalid game config: {0}")]
    InvalidConfig(String),
    /// No free seats.
    #[error("game is full")]
    GameFull,
    /// Only the host may do this.
    #[error("only the host can do that")]
    NotHost,
    /// Not enough players to start.
    #[error("need {required} players, have {actual}")]
    NotEnoughPlayers {
        /// Minimum players.
        required: usize,
        /// Current players.
        actual: usize,
    },
    /// Account already seated.
    #[error("user {0} already joined")]
    AlreadyInGame(UserId),
    /// Token already chosen by someone else.
    #[error("token {0} is taken")]
    TokenTaken(String),
    /// Unknown player.
    #[error("player {0} is not in this game")]
    PlayerNotInGame(PlayerId),
    /// Player is bankrupt or forfeited.
    #[error("player {0} is out of the game")]
    PlayerOut(PlayerId),
    /// Acting out of turn.
    #[error("not your turn")]
    NotYourTurn,
    /// Action not valid in this phase.
    #[error("action not allowed during {0:?} phase")]
    WrongPhase(TurnPhase),
    /// Doubles grant another roll that must be taken first.
    #[error("you rolled doubles and must roll again")]
    MustRollAgain,
    /// Not enough cash.
    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds {
        /// Amount required.
        needed: i64,
        /// Cash on hand.
        available: i64,
    },
    /// Unknown property id.
    #[error("unknown property {0}")]
    UnknownProperty(String),
    /// Property is not under the player.
    #[error("you are not on property {0}")]
    NotOnProperty(String),
    /// Property already has an owner.
    #[error("property {0} is already owned")]
    AlreadyOwned(String),
    /// Player does not own the property.
    #[error("you do not own {0}")]
    NotOwner(String),
    /// Already mortgaged.
    #[error("property {0} is already mortgaged")]
    AlreadyMortgaged(String),
    /// Not mortgaged.
    #[error("property {0} is not mortgaged")]
    NotMortgaged(String),
    /// Builds block the action.
    #[error("group of {0} has engagements built")]
    HasBuildings(String),
    /// Group cannot be built on.
    #[error("cannot build on {0}")]
    NotBuildable(String),
    /// Player does not own the whole group.
    #[error("you must own the whole group of {0}")]
    IncompleteGroup(String),
    /// A property in the group is mortgaged.
    #[error("a property in the group of {0} is mortgaged")]
    GroupMortgaged(String),
    /// Builds must be spread evenly.
    #[error("build evenly across the group of {0}")]
    UnevenBuild(String),
    /// Checkmark already built.
    #[error("property {0} is fully built")]
    MaxBuildLevel(String),
    /// A trade is awaiting a response.
    #[error("a trade is already pending")]
    TradePending,
    /// No matching trade.
    #[error("no pending trade {0}")]
    NoPendingTrade(String),
    /// Trade terms are invalid.
    #[error("invalid trade: {0}")]
    InvalidTrade(String),
}

/// Everything a rule needs besides the document.
pub struct RuleContext<'a> {
    /// Board layout.
    pub layout: &'a BoardLayout,
    /// Economic constants.
    pub config: &'a RulesConfig,
    /// The game's random source.
    pub rng: &'a mut dyn RandomSource,
    /// Events produced so far.
    pub log: EventLog,
}

impl<'a> RuleContext<'a> {
    /// New context with an empty event log stamped at `turn`.
    pub fn new(
        layout: &'a BoardLayout,
        config: &'a RulesConfig,
        rng: &'a mut dyn RandomSource,
        turn: u32,
    ) -> Self {
        Self {
            layout,
            config,
            rng,
            log: EventLog::new(turn),
        }
    }
}

// =============================================================================
// LOBBY
// =============================================================================

/// Seat a new player in a lobby.
pub fn join(game: &mut Game, player: Player, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
    require_status(game, GameStatus::Lobby)?;
    if game.players.len() >= game.max_players {
        return Err(RuleError::GameFull);
    }
    if game.player_by_user(&player.user_id).is_some() {
        return Err(RuleError::AlreadyInGame(player.user_id.clone()));
    }
    if game.players.iter().any(|p| p.token == player.token) {
        return Err(RuleError::TokenTaken(player.token.clone()));
    }
    ctx.log.push(GameEventData::PlayerJoined {
        player_id: player.id.clone(),
    });
    game.players.push(player);
    Ok(())
}

/// Remove a player from a lobby; the host seat migrates, an empty lobby is abandoned.
pub fn leave_lobby(game: &mut Game, player_id: &PlayerId, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
    require_status(game, GameStatus::Lobby)?;
    game.require_player(player_id)?;
    game.players.retain(|p| &p.id != player_id);
    ctx.log.push(GameEventData::PlayerLeft {
        player_id: player_id.clone(),
    });

    if game.players.is_empty() {
        game.transition(GameStatus::Abandoned)?;
        ctx.log.push(GameEventData::GameAbandoned);
        return Ok(());
    }

    if &game.host_id == player_id {
        game.host_id = game.players[0].id.clone();
        ctx.log.push(GameEventData::HostChanged {
            player_id: game.host_id.clone(),
        });
    }
    Ok(())
}

/// Change a player's token in the lobby.
pub fn set_token(game: &mut Game, player_id: &PlayerId, token: &str, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
    require_status(game, GameStatus::Lobby)?;
    if game.players.iter().any(|p| p.token == token && &p.id != player_id) {
        return Err(RuleError::TokenTaken(token.to_string()));
    }
    let player = game.require_player_mut(player_id)?;
    player.token = token.to_string();
    ctx.log.push(GameEventData::TokenChanged {
        player_id: player_id.clone(),
        token: token.to_string(),
    });
    Ok(())
}

/// Toggle a player's ready flag in the lobby.
pub fn set_ready(game: &mut Game, player_id: &PlayerId, ready: bool, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
    require_status(game, GameStatus::Lobby)?;
    let player = game.require_player_mut(player_id)?;
    if player.status == PlayerStatus::Disconnected {
        return Ok(());
    }
    player.status = if ready { PlayerStatus::Ready } else { PlayerStatus::Connected };
    ctx.log.push(GameEventData::PlayerReady {
        player_id: player_id.clone(),
        ready,
    });
    Ok(())
}

/// Start the game: randomize turn order, hand out starting cash.
pub fn start_game(game: &mut Game, requester: &PlayerId, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
    require_status(game, GameStatus::Lobby)?;
    if &game.host_id != requester {
        return Err(RuleError::NotHost);
    }
    if game.players.len() < game.min_players {
        return Err(RuleError::NotEnoughPlayers {
            required: game.min_players,
            actual: game.players.len(),
        });
    }

    let mut order: Vec<String> = game.players.iter().map(|p| p.id.0.clone()).collect();
    ctx.rng.shuffle_ids(&mut order);
    let order: Vec<PlayerId> = order.into_iter().map(PlayerId::from).collect();

    for player in &mut game.players {
        player.balance = ctx.config.starting_balance;
        player.position = 0;
        player.in_jail = false;
        player.jail_turns = 0;
        if player.status != PlayerStatus::Disconnected {
            player.status = PlayerStatus::Active;
        }
    }

    game.transition(GameStatus::Active)?;
    game.current_turn = order.first().cloned();
    game.turn_order = order.clone();
    game.turn = TurnState::default();
    game.turn_number = 1;
    game.started_at = Some(chrono::Utc::now());
    game.refresh_rents(ctx.layout);

    ctx.log.set_turn(game.turn_number);
    ctx.log.push(GameEventData::GameStarted { turn_order: order });
    Ok(())
}

// =============================================================================
// TURN ACTIONS
// =============================================================================

/// Roll both dice for the current player and resolve the move.
pub fn roll_dice(game: &mut Game, player_id: &PlayerId, ctx: &mut RuleContext<'_>) -> Result<[u8; 2], RuleError> {
    require_turn(game, player_id)?;
    if !can_roll(&game.turn) {
        return Err(RuleError::WrongPhase(game.turn.phase));
    }

    let dice = [ctx.rng.roll_die(), ctx.rng.roll_die()];
    let doubles = dice[0] == dice[1];
    let steps = dice[0] + dice[1];
    game.turn.last_roll = Some(dice);
    game.turn.extra_roll = false;
    ctx.log.push(GameEventData::DiceRolled {
        player_id: player_id.clone(),
        dice,
        doubles,
    });

    let in_jail = game.require_player(player_id)?.in_jail;
    if in_jail {
        roll_from_jail(game, player_id, steps, doubles, ctx)?;
        return Ok(dice);
    }

    if doubles {
        game.turn.doubles_count += 1;
        if game.turn.doubles_count >= ctx.config.max_consecutive_doubles {
            send_to_jail(game, player_id, JailReason::TripleDoubles, ctx)?;
            return Ok(dice);
        }
        game.turn.extra_roll = true;
    }

    move_by(game, player_id, steps, ctx)?;
    resolve_landing(game, player_id, ctx)?;
    Ok(dice)
}

fn roll_from_jail(
    game: &mut Game,
    player_id: &PlayerId,
    steps: u8,
    doubles: bool,
    ctx: &mut RuleContext<'_>,
) -> Result<(), RuleError> {
    let card_index = game
        .require_player(player_id)?
        .cards
        .iter()
        .position(|c| c == JAIL_FREE_CARD);

    if let Some(index) = card_index {
        let player = game.require_player_mut(player_id)?;
        player.cards.remove(index);
        release(player, 0, true, ctx);
    } else if doubles {
        let player = game.require_player_mut(player_id)?;
        release(player, 0, false, ctx);
    } else {
        let fine = ctx.config.jail_fine;
        let player = game.require_player_mut(player_id)?;
        player.jail_turns = player.jail_turns.saturating_sub(1);
        if player.jail_turns > 0 {
            let turns_left = player.jail_turns;
            ctx.log.push(GameEventData::JailTurnServed {
                player_id: player_id.clone(),
                turns_left,
            });
            game.turn.phase = TurnPhase::Manage;
            return Ok(());
        }
        if !charge(game, player_id, fine, None, ctx)? {
            return Ok(());
        }
        let player = game.require_player_mut(player_id)?;
        release(player, fine, false, ctx);
    }

    // Leaving jail never grants an extra roll.
    game.turn.doubles_count = 0;
    game.turn.extra_roll = false;
    move_by(game, player_id, steps, ctx)?;
    resolve_landing(game, player_id, ctx)
}

fn release(player: &mut Player, fine_paid: i64, used_card: bool, ctx: &mut RuleContext<'_>) {
    player.in_jail = false;
    player.jail_turns = 0;
    ctx.log.push(GameEventData::ReleasedFromJail {
        player_id: player.id.clone(),
        fine_paid,
        used_card,
    });
}

/// Card id kept in hand that skips a jail stay.
pub const JAIL_FREE_CARD: &str = "appeal-granted";

/// Buy the unowned property the current player is standing on.
pub fn buy_property(game: &mut Game, player_id: &PlayerId, property_id: &str, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
    require_turn(game, player_id)?;
    if game.turn.phase != TurnPhase::Buy {
        return Err(RuleError::WrongPhase(game.turn.phase));
    }
    let position = game.require_player(player_id)?.position;
    let property = game.require_property(property_id)?;
    if property.position != position {
        return Err(RuleError::NotOnProperty(property_id.to_string()));
    }
    if property.owner_id.is_some() {
        return Err(RuleError::AlreadyOwned(property_id.to_string()));
    }
    let price = property.price;
    require_funds(game, player_id, price)?;

    let player = game.require_player_mut(player_id)?;
    player.balance -= price;
    player.properties.push(property_id.to_string());
    game.require_property_mut(property_id)?.owner_id = Some(player_id.clone());
    game.refresh_rents(ctx.layout);
    game.turn.phase = TurnPhase::Manage;

    ctx.log.push(GameEventData::PropertyBought {
        player_id: player_id.clone(),
        property_id: property_id.to_string(),
        price,
    });
    Ok(())
}

/// Settle rent owed for the current landing. Mandatory: may bankrupt.
pub fn pay_rent(game: &mut Game, player_id: &PlayerId, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
    require_turn(game, player_id)?;
    if game.turn.phase != TurnPhase::PayRent {
        return Err(RuleError::WrongPhase(game.turn.phase));
    }
    let Some(rent) = game.turn.pending_rent.clone() else {
        return Err(RuleError::WrongPhase(game.turn.phase));
    };

    if !charge(game, player_id, rent.amount, Some(&rent.owner_id), ctx)? {
        return Ok(());
    }
    game.turn.pending_rent = None;
    game.turn.phase = TurnPhase::Manage;
    ctx.log.push(GameEventData::RentPaid {
        player_id: player_id.clone(),
        owner_id: rent.owner_id,
        property_id: rent.property_id,
        amount: rent.amount,
    });
    Ok(())
}

/// Draw from the deck the current player landed on and apply the card.
pub fn draw_card(game: &mut Game, player_id: &PlayerId, ctx: &mut RuleContext<'_>) -> Result<String, RuleError> {
    require_turn(game, player_id)?;
    if game.turn.phase != TurnPhase::DrawCard {
        return Err(RuleError::WrongPhase(game.turn.phase));
    }
    let Some(deck) = game.turn.pending_deck else {
        return Err(RuleError::WrongPhase(game.turn.phase));
    };

    let remaining = game.board.remaining_cards.entry(deck).or_insert(0);
    if *remaining == 0 {
        *remaining = deck.size();
        ctx.log.push(GameEventData::DeckReshuffled { deck });
    }
    *remaining -= 1;

    let cards = deck.cards();
    let card = cards[ctx.rng.next_index(cards.len())];
    game.turn.pending_deck = None;
    game.turn.phase = TurnPhase::Manage;
    ctx.log.push(GameEventData::CardDrawn {
        player_id: player_id.clone(),
        deck,
        card_id: card.id.to_string(),
    });

    apply_card(game, player_id, card.id, card.effect, ctx)?;
    Ok(card.id.to_string())
}

fn apply_card(
    game: &mut Game,
    player_id: &PlayerId,
    card_id: &str,
    effect: CardEffect,
    ctx: &mut RuleContext<'_>,
) -> Result<(), RuleError> {
    match effect {
        CardEffect::Collect { amount } => {
            game.require_player_mut(player_id)?.balance += amount;
            ctx.log.push(GameEventData::FundsCollected {
                player_id: player_id.clone(),
                amount,
            });
        }
        CardEffect::Pay { amount } => {
            if charge(game, player_id, amount, None, ctx)? {
                ctx.log.push(GameEventData::FundsPaid {
                    player_id: player_id.clone(),
                    amount,
                });
            }
        }
        CardEffect::AdvanceTo { position } => {
            let current = game.require_player(player_id)?.position;
            let size = ctx.layout.len();
            let steps = (position + size - current) % size;
            let steps = if steps == 0 { size } else { steps };
            move_by(game, player_id, steps, ctx)?;
            resolve_landing(game, player_id, ctx)?;
        }
        CardEffect::MoveBack { spaces } => {
            let size = ctx.layout.len();
            let player = game.require_player_mut(player_id)?;
            let from = player.position;
            player.position = (from + size - spaces % size) % size;
            let to = player.position;
            ctx.log.push(GameEventData::PlayerMoved {
                player_id: player_id.clone(),
                from,
                to,
            });
            resolve_landing(game, player_id, ctx)?;
        }
        CardEffect::GoToJail => {
            send_to_jail(game, player_id, JailReason::Card, ctx)?;
        }
        CardEffect::JailFree => {
            game.require_player_mut(player_id)?
                .cards
                .push(card_id.to_string());
        }
        CardEffect::Market { condition } => {
            game.market_condition = condition;
            game.refresh_rents(ctx.layout);
            ctx.log.push(GameEventData::MarketChanged { condition });
        }
        CardEffect::PropertyEffect { kind, turns } => {
            let target = game
                .board
                .properties
                .values()
                .filter(|p| p.owner_id.as_ref() == Some(player_id) && !p.mortgaged)
                .max_by_key(|p| (p.price, p.position))
                .map(|p| p.id.clone());
            if let Some(property_id) = target {
                game.require_property_mut(&property_id)?
                    .effects
                    .push(PropertyEffect {
                        kind,
                        turns_remaining: turns,
                    });
                game.refresh_rents(ctx.layout);
                ctx.log.push(GameEventData::EffectApplied {
                    property_id,
                    kind,
                    turns,
                });
            }
        }
    }
    Ok(())
}

/// Mortgage an owned, unbuilt property for half its price.
pub fn mortgage_property(game: &mut Game, player_id: &PlayerId, property_id: &str, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
    require_turn(game, player_id)?;
    let property = require_owned(game, player_id, property_id)?;
    if property.mortgaged {
        return Err(RuleError::AlreadyMortgaged(property_id.to_string()));
    }
    let group = property.group.clone();
    let price = property.price;
    if group_has_builds(game, ctx.layout, &group) {
        return Err(RuleError::HasBuildings(property_id.to_string()));
    }

    let amount = mortgage_value(price);
    game.require_property_mut(property_id)?.mortgaged = true;
    game.require_player_mut(player_id)?.balance += amount;
    game.refresh_rents(ctx.layout);
    ctx.log.push(GameEventData::PropertyMortgaged {
        player_id: player_id.clone(),
        property_id: property_id.to_string(),
        amount,
    });
    Ok(())
}

/// Lift a mortgage for its value plus interest.
pub fn unmortgage_property(game: &mut Game, player_id: &PlayerId, property_id: &str, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
    require_turn(game, player_id)?;
    let property = require_owned(game, player_id, property_id)?;
    if !property.mortgaged {
        return Err(RuleError::NotMortgaged(property_id.to_string()));
    }
    let amount = unmortgage_cost(property.price);
    require_funds(game, player_id, amount)?;

    game.require_player_mut(player_id)?.balance -= amount;
    game.require_property_mut(property_id)?.mortgaged = false;
    game.refresh_rents(ctx.layout);
    ctx.log.push(GameEventData::PropertyUnmortgaged {
        player_id: player_id.clone(),
        property_id: property_id.to_string(),
        amount,
    });
    Ok(())
}

/// Add one engagement (or the checkmark) to a property.
pub fn build_engagement(game: &mut Game, player_id: &PlayerId, property_id: &str, ctx: &mut RuleContext<'_>) -> Result<u8, RuleError> {
    require_turn(game, player_id)?;
    require_manage_window(game)?;
    let property = require_owned(game, player_id, property_id)?;
    let group = property.group.clone();
    let level = property.build_level();
    let cost = build_cost(property.price);

    if !ctx.layout.is_buildable(&group) {
        return Err(RuleError::NotBuildable(property_id.to_string()));
    }
    if game.group_owner(ctx.layout, &group).as_ref() != Some(player_id) {
        return Err(RuleError::IncompleteGroup(property_id.to_string()));
    }
    let members: Vec<_> = ctx
        .layout
        .group_members(&group)
        .into_iter()
        .filter_map(|id| game.board.properties.get(id))
        .collect();
    if members.iter().any(|p| p.mortgaged) {
        return Err(RuleError::GroupMortgaged(property_id.to_string()));
    }
    if level > MAX_ENGAGEMENTS {
        return Err(RuleError::MaxBuildLevel(property_id.to_string()));
    }
    let min_level = members.iter().map(|p| p.build_level()).min().unwrap_or(level);
    if level > min_level {
        return Err(RuleError::UnevenBuild(property_id.to_string()));
    }
    require_funds(game, player_id, cost)?;

    game.require_player_mut(player_id)?.balance -= cost;
    let property = game.require_property_mut(property_id)?;
    if property.engagements < MAX_ENGAGEMENTS {
        property.engagements += 1;
    } else {
        property.checkmark = true;
    }
    let new_level = property.build_level();
    game.refresh_rents(ctx.layout);
    ctx.log.push(GameEventData::EngagementBuilt {
        player_id: player_id.clone(),
        property_id: property_id.to_string(),
        level: new_level,
        cost,
    });
    Ok(new_level)
}

/// Terms of a trade proposal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeTerms {
    /// Counterpart.
    pub to_player_id: PlayerId,
    /// Cash the proposer gives.
    #[serde(default)]
    pub offered_cash: i64,
    /// Cash the counterpart gives.
    #[serde(default)]
    pub requested_cash: i64,
    /// Properties the proposer gives.
    #[serde(default)]
    pub offered_properties: Vec<String>,
    /// Properties the counterpart gives.
    #[serde(default)]
    pub requested_properties: Vec<String>,
}

/// Offer a trade to another player. One pending trade per game.
pub fn propose_trade(
    game: &mut Game,
    player_id: &PlayerId,
    trade_id: &str,
    terms: TradeTerms,
    ctx: &mut RuleContext<'_>,
) -> Result<(), RuleError> {
    require_turn(game, player_id)?;
    require_manage_window(game)?;
    if game.pending_trade.is_some() {
        return Err(RuleError::TradePending);
    }
    let offer = TradeOffer {
        id: trade_id.to_string(),
        from_player_id: player_id.clone(),
        to_player_id: terms.to_player_id,
        offered_cash: terms.offered_cash,
        requested_cash: terms.requested_cash,
        offered_properties: terms.offered_properties,
        requested_properties: terms.requested_properties,
    };
    validate_trade(game, &offer)?;

    ctx.log.push(GameEventData::TradeProposed {
        trade_id: offer.id.clone(),
        from_player_id: offer.from_player_id.clone(),
        to_player_id: offer.to_player_id.clone(),
    });
    game.pending_trade = Some(offer);
    Ok(())
}

/// Accept or reject the pending trade. Only the counterpart may respond.
pub fn respond_trade(
    game: &mut Game,
    player_id: &PlayerId,
    trade_id: &str,
    accept: bool,
    ctx: &mut RuleContext<'_>,
) -> Result<(), RuleError> {
    require_status(game, GameStatus::Active)?;
    let offer = match &game.pending_trade {
        Some(offer) if offer.id == trade_id => offer.clone(),
        _ => return Err(RuleError::NoPendingTrade(trade_id.to_string())),
    };
    if &offer.to_player_id != player_id {
        return Err(RuleError::NotYourTurn);
    }

    if !accept {
        game.pending_trade = None;
        ctx.log.push(GameEventData::TradeRejected {
            trade_id: offer.id,
        });
        return Ok(());
    }

    validate_trade(game, &offer)?;
    transfer_properties(game, &offer.offered_properties, &offer.from_player_id, &offer.to_player_id)?;
    transfer_properties(game, &offer.requested_properties, &offer.to_player_id, &offer.from_player_id)?;
    let net = offer.offered_cash - offer.requested_cash;
    game.require_player_mut(&offer.from_player_id)?.balance -= net;
    game.require_player_mut(&offer.to_player_id)?.balance += net;
    game.pending_trade = None;
    game.refresh_rents(ctx.layout);

    ctx.log.push(GameEventData::TradeCompleted { trade_id: offer.id });
    Ok(())
}

fn validate_trade(game: &Game, offer: &TradeOffer) -> Result<(), RuleError> {
    if offer.from_player_id == offer.to_player_id {
        return Err(RuleError::InvalidTrade("cannot trade with yourself".into()));
    }
    let counterpart = game.require_player(&offer.to_player_id)?;
    if !counterpart.is_in_play() {
        return Err(RuleError::PlayerOut(offer.to_player_id.clone()));
    }
    if offer.offered_cash < 0 || offer.requested_cash < 0 {
        return Err(RuleError::InvalidTrade("cash amounts must be positive".into()));
    }
    if offer.offered_cash == 0
        && offer.requested_cash == 0
        && offer.offered_properties.is_empty()
        && offer.requested_properties.is_empty()
    {
        return Err(RuleError::InvalidTrade("trade is empty".into()));
    }
    let mut seen = BTreeSet::new();
    for (ids, owner) in [
        (&offer.offered_properties, &offer.from_player_id),
        (&offer.requested_properties, &offer.to_player_id),
    ] {
        for id in ids {
            if !seen.insert(id.as_str()) {
                return Err(RuleError::InvalidTrade(format!("{} listed more than once", id)));
            }
            let property = game.require_property(id)?;
            if property.owner_id.as_ref() != Some(owner) {
                return Err(RuleError::NotOwner(id.clone()));
            }
            if property.has_builds() {
                return Err(RuleError::HasBuildings(id.clone()));
            }
        }
    }
    require_funds(game, &offer.from_player_id, offer.offered_cash)?;
    require_funds(game, &offer.to_player_id, offer.requested_cash)?;
    Ok(())
}

fn transfer_properties(game: &mut Game, ids: &[String], from: &PlayerId, to: &PlayerId) -> Result<(), RuleError> {
    for id in ids {
        game.require_property_mut(id)?.owner_id = Some(to.clone());
        game.require_player_mut(from)?.properties.retain(|p| p != id);
        let receiver = game.require_player_mut(to)?;
        if !receiver.properties.contains(id) {
            receiver.properties.push(id.clone());
        }
    }
    Ok(())
}

/// Finish the current turn and pass to the next player in order.
pub fn end_turn(game: &mut Game, player_id: &PlayerId, ctx: &mut RuleContext<'_>) -> Result<Option<PlayerId>, RuleError> {
    require_turn(game, player_id)?;
    match game.turn.phase {
        TurnPhase::Manage | TurnPhase::Buy => {}
        phase => return Err(RuleError::WrongPhase(phase)),
    }
    if game.turn.extra_roll {
        return Err(RuleError::MustRollAgain);
    }

    tick_effects(game, ctx);
    let next = next_in_order(game, player_id);
    game.current_turn = next.clone();
    begin_turn(game, player_id, ctx);
    ctx.log.push(GameEventData::TurnEnded {
        player_id: player_id.clone(),
        next_player_id: next.clone(),
    });
    Ok(next)
}

// =============================================================================
// LIFECYCLE
// =============================================================================

/// Host pauses an active game.
pub fn pause(game: &mut Game, requester: &PlayerId, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
    require_status(game, GameStatus::Active)?;
    if &game.host_id != requester {
        return Err(RuleError::NotHost);
    }
    game.transition(GameStatus::Paused)?;
    ctx.log.push(GameEventData::GamePaused);
    Ok(())
}

/// Host resumes a paused game.
pub fn resume(game: &mut Game, requester: &PlayerId, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
    require_status(game, GameStatus::Paused)?;
    if &game.host_id != requester {
        return Err(RuleError::NotHost);
    }
    game.transition(GameStatus::Active)?;
    ctx.log.push(GameEventData::GameResumed);
    Ok(())
}

/// Remove a player from play. Safe to repeat.
pub fn forfeit(game: &mut Game, player_id: &PlayerId, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
    if game.status == GameStatus::Lobby {
        return leave_lobby(game, player_id, ctx);
    }
    if !matches!(game.status, GameStatus::Active | GameStatus::Paused) {
        return Err(RuleError::WrongStatus {
            expected: GameStatus::Active,
            actual: game.status,
        });
    }
    let player = game.require_player(player_id)?;
    if !player.is_in_play() {
        return Ok(());
    }

    release_assets(game, player_id);
    let player = game.require_player_mut(player_id)?;
    player.status = PlayerStatus::Forfeited;
    player.balance = 0;
    ctx.log.push(GameEventData::PlayerForfeited {
        player_id: player_id.clone(),
    });
    remove_from_turn_order(game, player_id, ctx);
    game.refresh_rents(ctx.layout);
    check_game_over(game, ctx)
}

/// Record a dropped connection.
pub fn mark_disconnected(
    game: &mut Game,
    player_id: &PlayerId,
    at: chrono::DateTime<chrono::Utc>,
    ctx: &mut RuleContext<'_>,
) -> Result<(), RuleError> {
    let player = game.require_player_mut(player_id)?;
    if !player.is_in_play() || player.status == PlayerStatus::Disconnected {
        return Ok(());
    }
    player.status = PlayerStatus::Disconnected;
    player.disconnected_at = Some(at);
    player.session_id = None;
    ctx.log.push(GameEventData::PlayerDisconnected {
        player_id: player_id.clone(),
    });
    Ok(())
}

/// Record a restored connection.
pub fn mark_connected(
    game: &mut Game,
    player_id: &PlayerId,
    session_id: Option<String>,
    ctx: &mut RuleContext<'_>,
) -> Result<(), RuleError> {
    let playing = matches!(game.status, GameStatus::Active | GameStatus::Paused);
    let player = game.require_player_mut(player_id)?;
    player.session_id = session_id;
    if player.status != PlayerStatus::Disconnected {
        return Ok(());
    }
    player.status = if playing {
        PlayerStatus::Active
    } else {
        PlayerStatus::Connected
    };
    player.disconnected_at = None;
    ctx.log.push(GameEventData::PlayerReconnected {
        player_id: player_id.clone(),
    });
    Ok(())
}

// =============================================================================
// HELPERS
// =============================================================================

fn require_status(game: &Game, expected: GameStatus) -> Result<(), RuleError> {
    if game.status != expected {
        return Err(RuleError::WrongStatus {
            expected,
            actual: game.status,
        });
    }
    Ok(())
}

fn require_turn(game: &Game, player_id: &PlayerId) -> Result<(), RuleError> {
    require_status(game, GameStatus::Active)?;
    let player = game.require_player(player_id)?;
    if !player.is_in_play() {
        return Err(RuleError::PlayerOut(player_id.clone()));
    }
    if game.current_turn.as_ref() != Some(player_id) {
        return Err(RuleError::NotYourTurn);
    }
    Ok(())
}

/// Trading and building happen before rolling or once landing is resolved.
fn require_manage_window(game: &Game) -> Result<(), RuleError> {
    match game.turn.phase {
        TurnPhase::Roll | TurnPhase::Manage => Ok(()),
        phase => Err(RuleError::WrongPhase(phase)),
    }
}

fn require_funds(game: &Game, player_id: &PlayerId, amount: i64) -> Result<(), RuleError> {
    let available = game.require_player(player_id)?.balance;
    if available < amount {
        return Err(RuleError::InsufficientFunds {
            needed: amount,
            available,
        });
    }
    Ok(())
}

fn require_owned<'g>(game: &'g Game, player_id: &PlayerId, property_id: &str) -> Result<&'g crate::game::state::Property, RuleError> {
    let property = game.require_property(property_id)?;
    if property.owner_id.as_ref() != Some(player_id) {
        return Err(RuleError::NotOwner(property_id.to_string()));
    }
    Ok(property)
}

fn can_roll(turn: &TurnState) -> bool {
    turn.phase == TurnPhase::Roll
        || (turn.extra_roll && matches!(turn.phase, TurnPhase::Manage | TurnPhase::Buy))
}

fn group_has_builds(game: &Game, layout: &BoardLayout, group: &str) -> bool {
    layout
        .group_members(group)
        .into_iter()
        .filter_map(|id| game.board.properties.get(id))
        .any(|p| p.has_builds())
}

fn move_by(game: &mut Game, player_id: &PlayerId, steps: u8, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
    let size = ctx.layout.len().max(1);
    let salary = ctx.config.start_salary;
    let player = game.require_player_mut(player_id)?;
    let from = player.position;
    let raw = from as u16 + steps as u16;
    player.position = (raw % size as u16) as u8;
    let to = player.position;
    let passed_start = raw >= size as u16;
    if passed_start {
        player.balance += salary;
    }
    ctx.log.push(GameEventData::PlayerMoved {
        player_id: player_id.clone(),
        from,
        to,
    });
    if passed_start {
        ctx.log.push(GameEventData::SalaryCollected {
            player_id: player_id.clone(),
            amount: salary,
        });
    }
    Ok(())
}

fn resolve_landing(game: &mut Game, player_id: &PlayerId, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
    let position = game.require_player(player_id)?.position;
    game.turn.phase = TurnPhase::Manage;

    match ctx.layout.space(position).clone() {
        Space::Start | Space::Jail | Space::FreeParking => {}
        Space::Property { id } => {
            let property = game.require_property(&id)?;
            match property.owner_id.clone() {
                None => game.turn.phase = TurnPhase::Buy,
                Some(owner) if &owner == player_id => {}
                Some(owner) => {
                    let owner_in_play = game.player(&owner).map(|p| p.is_in_play()).unwrap_or(false);
                    let amount = property.rent_current;
                    if owner_in_play && !property.mortgaged && amount > 0 {
                        game.turn.pending_rent = Some(crate::game::state::PendingRent {
                            property_id: id.clone(),
                            owner_id: owner.clone(),
                            amount,
                        });
                        game.turn.phase = TurnPhase::PayRent;
                        ctx.log.push(GameEventData::RentDue {
                            player_id: player_id.clone(),
                            owner_id: owner,
                            property_id: id,
                            amount,
                        });
                    }
                }
            }
        }
        Space::Tax { amount } => {
            if charge(game, player_id, amount, None, ctx)? {
                ctx.log.push(GameEventData::TaxPaid {
                    player_id: player_id.clone(),
                    amount,
                });
            }
        }
        Space::Card { deck } => {
            game.turn.pending_deck = Some(deck);
            game.turn.phase = TurnPhase::DrawCard;
        }
        Space::GoToJail => {
            send_to_jail(game, player_id, JailReason::GoToJailSpace, ctx)?;
        }
    }
    Ok(())
}

fn send_to_jail(game: &mut Game, player_id: &PlayerId, reason: JailReason, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
    let jail_turns = ctx.config.jail_turns;
    let player = game.require_player_mut(player_id)?;
    player.position = JAIL_POSITION;
    player.in_jail = true;
    player.jail_turns = jail_turns;
    game.turn.doubles_count = 0;
    game.turn.extra_roll = false;
    game.turn.pending_rent = None;
    game.turn.pending_deck = None;
    game.turn.phase = TurnPhase::Manage;
    ctx.log.push(GameEventData::SentToJail {
        player_id: player_id.clone(),
        reason,
    });
    Ok(())
}

/// Take a mandatory payment. Returns `false` when the player went bankrupt instead.
fn charge(
    game: &mut Game,
    player_id: &PlayerId,
    amount: i64,
    creditor: Option<&PlayerId>,
    ctx: &mut RuleContext<'_>,
) -> Result<bool, RuleError> {
    let balance = game.require_player(player_id)?.balance;
    if balance >= amount {
        game.require_player_mut(player_id)?.balance -= amount;
        if let Some(creditor) = creditor {
            game.require_player_mut(creditor)?.balance += amount;
        }
        return Ok(true);
    }

    declare_bankruptcy(game, player_id, creditor, ctx)?;
    Ok(false)
}

/// Player cannot pay: remaining cash goes to the creditor, properties to the bank.
fn declare_bankruptcy(
    game: &mut Game,
    player_id: &PlayerId,
    creditor: Option<&PlayerId>,
    ctx: &mut RuleContext<'_>,
) -> Result<(), RuleError> {
    let remaining = game.require_player(player_id)?.balance.max(0);
    if let Some(creditor) = creditor {
        game.require_player_mut(creditor)?.balance += remaining;
    }
    release_assets(game, player_id);
    let player = game.require_player_mut(player_id)?;
    player.balance = 0;
    player.status = PlayerStatus::Bankrupt;
    ctx.log.push(GameEventData::PlayerBankrupt {
        player_id: player_id.clone(),
        creditor_id: creditor.cloned(),
    });
    remove_from_turn_order(game, player_id, ctx);
    game.refresh_rents(ctx.layout);
    check_game_over(game, ctx)
}

fn release_assets(game: &mut Game, player_id: &PlayerId) {
    for property in game.board.properties.values_mut() {
        if property.owner_id.as_ref() == Some(player_id) {
            property.reset_to_bank();
        }
    }
    if let Some(player) = game.player_mut(player_id) {
        player.properties.clear();
        player.cards.clear();
        player.in_jail = false;
        player.jail_turns = 0;
    }
    let involved = game
        .pending_trade
        .as_ref()
        .map(|t| &t.from_player_id == player_id || &t.to_player_id == player_id)
        .unwrap_or(false);
    if involved {
        game.pending_trade = None;
    }
}

fn next_in_order(game: &Game, after: &PlayerId) -> Option<PlayerId> {
    let order = &game.turn_order;
    let index = order.iter().position(|p| p == after)?;
    if order.len() < 2 {
        return None;
    }
    Some(order[(index + 1) % order.len()].clone())
}

fn remove_from_turn_order(game: &mut Game, player_id: &PlayerId, ctx: &mut RuleContext<'_>) {
    let was_current = game.current_turn.as_ref() == Some(player_id);
    let next = if was_current {
        next_in_order(game, player_id)
    } else {
        None
    };
    game.turn_order.retain(|p| p != player_id);

    if was_current {
        game.current_turn = next.clone();
        begin_turn(game, player_id, ctx);
        ctx.log.push(GameEventData::TurnEnded {
            player_id: player_id.clone(),
            next_player_id: next,
        });
    }
}

fn begin_turn(game: &mut Game, previous: &PlayerId, ctx: &mut RuleContext<'_>) {
    game.turn = TurnState::default();
    game.turn_number += 1;
    let stale = game
        .pending_trade
        .as_ref()
        .map(|t| &t.from_player_id == previous)
        .unwrap_or(false);
    if stale {
        if let Some(trade) = game.pending_trade.take() {
            ctx.log.push(GameEventData::TradeRejected { trade_id: trade.id });
        }
    }
    ctx.log.set_turn(game.turn_number);
}

fn tick_effects(game: &mut Game, ctx: &mut RuleContext<'_>) {
    let mut changed = false;
    for property in game.board.properties.values_mut() {
        if property.effects.is_empty() {
            continue;
        }
        for effect in &mut property.effects {
            effect.turns_remaining = effect.turns_remaining.saturating_sub(1);
        }
        let (expired, kept): (Vec<_>, Vec<_>) = property
            .effects
            .drain(..)
            .partition(|e| e.turns_remaining == 0);
        property.effects = kept;
        for effect in expired {
            changed = true;
            ctx.log.push(GameEventData::EffectExpired {
                property_id: property.id.clone(),
                kind: effect.kind,
            });
        }
    }
    if changed {
        game.refresh_rents(ctx.layout);
    }
}

fn check_game_over(game: &mut Game, ctx: &mut RuleContext<'_>) -> Result<(), RuleError> {
    if !matches!(game.status, GameStatus::Active | GameStatus::Paused) {
        return Ok(());
    }
    let remaining: Vec<PlayerId> = game.players_in_play().map(|p| p.id.clone()).collect();
    match remaining.as_slice() {
        [winner] => {
            game.winner_id = Some(winner.clone());
            game.transition(GameStatus::Completed)?;
            ctx.log.push(GameEventData::GameCompleted {
                winner_id: winner.clone(),
            });
        }
        [] => {
            game.transition(GameStatus::Abandoned)?;
            ctx.log.push(GameEventData::GameAbandoned);
        }
        _ => {}
    }
    Ok(())
}
