// Deterministic UTXO selection for payouts

use crate::error::PayoutError;
use crate::node::{OutPointRef, UnspentOutput};

/// Outputs below this are uneconomic; such change goes to the fee instead
pub const DUST_LIMIT_SATOSHIS: u64 = 546;

// P2WPKH size estimates in vbytes
const TX_OVERHEAD_VBYTES: u64 = 11;
const INPUT_VBYTES: u64 = 68;
const OUTPUT_VBYTES: u64 = 31;

pub fn estimate_vsize(inputs: usize, outputs: usize) -> u64 {
    TX_OVERHEAD_VBYTES + INPUT_VBYTES * inputs as u64 + OUTPUT_VBYTES * outputs as u64
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub inputs: Vec<UnspentOutput>,
    pub total_input_satoshis: u64,
    pub fee_satoshis: u64,
    /// Zero when there is no change output
    pub change_satoshis: u64,
}

/// Largest first, ties broken by outpoint
fn ordered(utxos: &[UnspentOutput]) -> Vec<&UnspentOutput> {
    let mut ordered: Vec<&UnspentOutput> = utxos.iter().collect();
    ordered.sort_by(|a, b| {
        b.amount
            .cmp(&a.amount)
            .then_with(|| a.txid.cmp(&b.txid))
            .then_with(|| a.vout.cmp(&b.vout))
    });
    ordered
}

/// Build the selection once `total` covers `amount + fee`. Sufficiency is
/// checked before change is computed.
fn finish(
    inputs: Vec<UnspentOutput>,
    total: u64,
    amount: u64,
    fee: u64,
) -> Result<Selection, PayoutError> {
    let required = amount
        .checked_add(fee)
        .ok_or(PayoutError::InvalidAmount(amount))?;
    let change = total
        .checked_sub(required)
        .ok_or(PayoutError::InsufficientFunds {
            required,
            available: total,
        })?;
    let (change, fee) = if change < DUST_LIMIT_SATOSHIS {
        (0, fee + change)
    } else {
        (change, fee)
    };
    Ok(Selection {
        inputs,
        total_input_satoshis: total,
        fee_satoshis: fee,
        change_satoshis: change,
    })
}

/// Select inputs paying `fee_rate` sat/vB for a payee plus change output.
/// `must_spend`, when listed in `utxos`, is always the first input. The fee
/// grows with every input added.
pub fn select_spending(
    utxos: &[UnspentOutput],
    must_spend: Option<&OutPointRef>,
    amount: u64,
    fee_rate: u64,
) -> Result<Selection, PayoutError> {
    let mut candidates = ordered(utxos);
    if let Some(outpoint) = must_spend {
        if let Some(position) = candidates.iter().position(|u| u.outpoint() == *outpoint) {
            let pinned = candidates.remove(position);
            candidates.insert(0, pinned);
        }
    }

    let mut inputs = Vec::new();
    let mut total: u64 = 0;
    let mut fee = fee_rate.saturating_mul(estimate_vsize(1, 2));
    for utxo in candidates {
        total = total.saturating_add(utxo.amount.to_sat());
        inputs.push(utxo.clone());
        fee = fee_rate.saturating_mul(estimate_vsize(inputs.len(), 2));
        if total >= amount.saturating_add(fee) {
            return finish(inputs, total, amount, fee);
        }
    }
    Err(PayoutError::InsufficientFunds {
        required: amount.saturating_add(fee),
        available: total,
    })
}
