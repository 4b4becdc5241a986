#![no_main]
use libfuzzer_sys::fuzz_target;
use tracecheck_log::{encode_all, ScheduleDecoder, SCHEDULE_ENTRY_SIZE};

fuzz_target!(|data: &[u8]| {
    let mut decoder = ScheduleDecoder::new(data);
    let mut entries = Vec::new();
    while let Ok(Some(entry)) = decoder.next_entry() {
        entries.push(entry);
    }
    // Every whole entry decodes; only a trailing partial one may fail.
    assert_eq!(entries.len(), data.len() / SCHEDULE_ENTRY_SIZE);

    let whole = entries.len() * SCHEDULE_ENTRY_SIZE;
    assert_eq!(encode_all(&entries), &data[..whole]);
});
