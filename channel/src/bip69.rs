//! Commitment output ordering: BIP 69 lexicographic order with the BOLT #3
//! refinement that two otherwise identical HTLC outputs order by expiry.

use std::cmp::Ordering;

use bitcoin::TxOut;

/// Sorts outputs (each with an attached payload, typically the HTLC behind
/// it) by amount, then script, then the payload tie-break.
pub fn sort_outputs<T>(outputs: &mut [(TxOut, T)], tie_break: impl Fn(&T, &T) -> Ordering) {
    outputs.sort_by(|(a, a_aux), (b, b_aux)| {
        a.value
            .cmp(&b.value)
            .then_with(|| a.script_pubkey.as_bytes().cmp(b.script_pubkey.as_bytes()))
            .then_with(|| tie_break(a_aux, b_aux))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{Amount, ScriptBuf};

    fn out(value: u64, script: &[u8]) -> TxOut {
        TxOut {
            value: Amount::from_sat(value),
            script_pubkey: ScriptBuf::from_bytes(script.to_vec()),
        }
    }

    #[test]
    fn orders_by_value_then_script() {
        let mut outputs = vec![
            (out(2000, &[0x00]), 0u32),
            (out(1000, &[0xff]), 0),
            (out(1000, &[0x01]), 0),
        ];
        sort_outputs(&mut outputs, |_, _| Ordering::Equal);
        let values: Vec<u64> = outputs.iter().map(|(o, _)| o.value.to_sat()).collect();
        assert_eq!(values, vec![1000, 1000, 2000]);
        assert_eq!(outputs[0].0.script_pubkey.as_bytes(), &[0x01]);
    }

    #[test]
    fn identical_outputs_fall_back_to_tie_break() {
        let mut outputs = vec![
            (out(1000, &[0xaa]), 504u32),
            (out(1000, &[0xaa]), 500),
            (out(1000, &[0xaa]), 502),
        ];
        sort_outputs(&mut outputs, |a, b| a.cmp(b));
        let expiries: Vec<u32> = outputs.iter().map(|(_, e)| *e).collect();
        assert_eq!(expiries, vec![500, 502, 504]);
    }
}
