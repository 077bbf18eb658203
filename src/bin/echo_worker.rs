//! Reference worker process for [`rpool::process_backend::ProcessBackend`].
//! Reads length-prefixed postcard `TaskEnvelope<u64>` frames from stdin,
//! squares the task, and writes a `ResultEnvelope<u64>` frame back on
//! stdout, until stdin closes.

use rpool::backend::{ResultEnvelope, TaskEnvelope};
use rpool::framing::{read_frame, write_frame};
use std::io::{self, BufReader, BufWriter};

fn main() {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut reader = BufReader::new(stdin.lock());
    let mut writer = BufWriter::new(stdout.lock());

    loop {
        let envelope = match read_frame::<TaskEnvelope<u64>>(&mut reader) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => break,
            Err(err) => {
                eprintln!("rpool-echo-worker: failed to read task frame: {err}");
                std::process::exit(1);
            }
        };

        let outcome = envelope.task.checked_mul(envelope.task).ok_or_else(|| "overflow while squaring task".to_string());
        let result = ResultEnvelope {
            job_id: envelope.job_id,
            chunk: envelope.chunk,
            outcome,
        };

        if write_frame(&mut writer, &result).is_err() {
            break;
        }
    }
}
