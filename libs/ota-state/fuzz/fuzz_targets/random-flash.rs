#![no_main]

extern crate libfuzzer_sys;
extern crate std;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use ota_state::flash::FlashJournal;
use ota_state::flash::mock::MockFlashBase;
use ota_state::record::UpdateRecord;

type Flash = MockFlashBase<4, 4, 64>;

#[derive(Arbitrary, Debug)]
struct Input<'a> {
    contents: &'a [u8],
    record: UpdateRecord,
}

fuzz_target!(|input: Input<'_>| fuzz(input));

/// Arbitrary garbage in the record region never prevents opening the journal,
/// and a record written on top of it survives a reopen.
fn fuzz(input: Input<'_>) {
    let mut flash = Flash::new(None, false);
    let len = input.contents.len().min(flash.as_bytes().len());
    flash.as_bytes_mut()[..len].copy_from_slice(&input.contents[..len]);

    futures::executor::block_on(async {
        let mut journal = FlashJournal::new::<128>(&mut flash).await.unwrap();
        journal.set::<128>(&input.record).await.unwrap();
        assert_eq!(journal.get(), Some(&input.record));

        let journal = FlashJournal::new::<128>(&mut flash).await.unwrap();
        assert_eq!(journal.get(), Some(&input.record));
    });
}
