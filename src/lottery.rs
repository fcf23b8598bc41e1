//! Draw predicate and winner grouping.

use crate::bet::BetRecord;
use std::collections::HashMap;
use tracing::{info, warn};

/// Agency id to the document ids of its winning bets, in store order.
pub type WinnersIndex = HashMap<String, Vec<u32>>;

/// Decides whether a bet won the draw.
pub trait Draw: Send + Sync {
    fn has_won(&self, record: &BetRecord) -> bool;
}

/// A bet wins when its chosen number equals a fixed winning number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WinningNumber(pub u32);

impl Draw for WinningNumber {
    fn has_won(&self, record: &BetRecord) -> bool {
        record
            .chosen_number
            .trim()
            .parse::<u32>()
            .is_ok_and(|number| number == self.0)
    }
}

/// Group the document ids of winning bets by agency.
///
/// Document ids travel as `u32` on the wire; a winning bet whose id does not
/// fit is logged and left out.
pub fn find_winners(bets: &[BetRecord], draw: &dyn Draw) -> WinnersIndex {
    let mut winners = WinnersIndex::new();

    for bet in bets.iter().filter(|bet| draw.has_won(bet)) {
        match bet.document_id.trim().parse::<u32>() {
            Ok(document) => winners
                .entry(bet.agency_id.clone())
                .or_default()
                .push(document),
            Err(_) => warn!(
                agency = %bet.agency_id,
                document = %bet.document_id,
                "Winning bet has a non-numeric document id, skipping"
            ),
        }
    }

    info!(
        bets = bets.len(),
        winners = winners.values().map(Vec::len).sum::<usize>(),
        agencies = winners.len(),
        "Draw complete"
    );
    winners
}
