#![no_main]
use libfuzzer_sys::fuzz_target;
use tracecheck_log::TraceRecord;

fuzz_target!(|data: &[u8]| {
    // Malformed lines must surface as errors, never panics.
    if let Ok(records) = TraceRecord::read_json_lines(data) {
        for record in &records {
            let _ = record.is_counted_instr();
            let _ = record.is_thread_exit();
        }
    }
});
