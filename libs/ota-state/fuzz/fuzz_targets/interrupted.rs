#![no_main]

extern crate libfuzzer_sys;
extern crate std;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use ota_state::flash::mock::{MockFlashBase, MockFlashError};
use ota_state::flash::{Error, FlashJournal};
use ota_state::record::UpdateRecord;

type Flash = MockFlashBase<4, 4, 64>;

#[derive(Arbitrary, Debug)]
struct Input {
    records: Vec<UpdateRecord>,
    /// Bytes erased or written before the power is cut.
    cut: u16,
}

fuzz_target!(|input: Input| fuzz(input));

/// A power cut at any byte leaves either the previous or the new record, and the
/// journal keeps working after reopening it.
fn fuzz(input: Input) {
    let mut flash = Flash::new(Some(input.cut as u32), false);

    futures::executor::block_on(async {
        let mut durable: Option<UpdateRecord> = None;
        let mut remaining = input.records.iter();

        let interrupted = {
            let mut journal = FlashJournal::new::<128>(&mut flash).await.unwrap();
            loop {
                let Some(record) = remaining.next() else {
                    break None;
                };
                match journal.set::<128>(record).await {
                    Ok(()) => durable = Some(*record),
                    Err(Error::Other(MockFlashError::EarlyShutoff(..))) => break Some(*record),
                    Err(e) => panic!("Unexpected error {e:?}"),
                }
            }
        };

        flash.remove_shutoff();
        let mut journal = FlashJournal::new::<128>(&mut flash).await.unwrap();
        let recovered = journal.get().copied();

        match interrupted {
            None => assert_eq!(recovered, durable),
            Some(pending) => assert!(
                recovered == durable || recovered == Some(pending),
                "Record lost: had {durable:?}, writing {pending:?}, found {recovered:?}"
            ),
        }

        for record in remaining {
            journal.set::<128>(record).await.unwrap();
            assert_eq!(journal.get(), Some(record));
        }
    });
}
