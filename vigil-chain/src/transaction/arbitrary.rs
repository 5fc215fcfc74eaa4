use proptest::{array, prelude::*};

use crate::amount::Amount;
use crate::transparent;

use super::*;

impl Arbitrary for Hash {
    type Parameters = ();

    fn arbitrary_with(_args: ()) -> Self::Strategy {
        array::uniform32(any::<u8>()).prop_map(Hash).boxed()
    }

    type Strategy = BoxedStrategy<Self>;
}

impl Arbitrary for LockTime {
    type Parameters = ();

    fn arbitrary_with(_args: ()) -> Self::Strategy {
        prop_oneof![
            (0u32..500_000_000).prop_map(LockTime::Height),
            (500_000_000u32..).prop_map(LockTime::Time),
        ]
        .boxed()
    }

    type Strategy = BoxedStrategy<Self>;
}

impl Arbitrary for Transaction {
    type Parameters = ();

    fn arbitrary_with(_args: ()) -> Self::Strategy {
        (
            any::<i32>(),
            proptest::collection::vec(prevout_input(), 1..4),
            proptest::collection::vec(arbitrary_output(), 1..4),
            any::<LockTime>(),
        )
            .prop_map(|(version, inputs, outputs, locktime)| {
                Transaction::new(version, inputs, outputs, locktime)
            })
            .boxed()
    }

    type Strategy = BoxedStrategy<Self>;
}

fn prevout_input() -> impl Strategy<Value = transparent::Input> {
    (
        any::<transparent::OutPoint>(),
        proptest::collection::vec(any::<u8>(), 0..64),
        any::<u32>(),
    )
        .prop_map(|(outpoint, script, sequence)| transparent::Input::PrevOut {
            outpoint,
            unlock_script: transparent::Script(script),
            sequence,
        })
}

fn arbitrary_output() -> impl Strategy<Value = transparent::Output> {
    (0u64..21_000_000 * crate::amount::COIN, any::<transparent::Script>()).prop_map(
        |(sat, lock_script)| transparent::Output {
            value: Amount::from_sat(sat),
            lock_script,
        },
    )
}

proptest! {
    #[test]
    fn transaction_round_trip(tx in any::<Transaction>()) {
        use crate::serialization::{BitcoinDeserialize, BitcoinSerialize};

        let bytes = tx.bitcoin_serialize_to_vec().unwrap();
        prop_assert_eq!(bytes.len(), tx.len());

        let parsed = Transaction::bitcoin_deserialize(std::io::Cursor::new(&bytes)).unwrap();
        prop_assert_eq!(parsed, tx);
    }
}
