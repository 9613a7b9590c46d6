//! `COPY ... FROM STDIN` text-format encoding of job batches.
//!
//! Columns are tab separated, rows newline terminated. Backslash, tab,
//! newline and carriage return inside a value are backslash escaped.

use jobsdb_core::Job;

use super::r#trait::StoreError;

/// Columns written by a bulk copy, in row order.
pub const COPY_COLUMNS: [&str; 5] = ["uuid", "user_id", "custom_val", "parameters", "event_payload"];

pub fn copy_statement(job_table: &str) -> String {
    format!(
        "COPY \"{job_table}\" ({}) FROM STDIN",
        COPY_COLUMNS.join(", ")
    )
}

/// Encode `jobs` as one COPY payload.
pub fn encode_copy_rows(jobs: &[Job]) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::with_capacity(jobs.len() * 128);
    for job in jobs {
        buf.extend_from_slice(job.uuid.hyphenated().to_string().as_bytes());
        buf.push(b'\t');
        push_field(&mut buf, job, "user_id", job.user_id.as_bytes())?;
        buf.push(b'\t');
        push_field(&mut buf, job, "custom_val", job.custom_val.as_bytes())?;
        buf.push(b'\t');
        push_field(&mut buf, job, "parameters", &job.parameters)?;
        buf.push(b'\t');
        push_field(&mut buf, job, "event_payload", &job.event_payload)?;
        buf.push(b'\n');
    }
    Ok(buf)
}

fn push_field(buf: &mut Vec<u8>, job: &Job, field: &str, value: &[u8]) -> Result<(), StoreError> {
    if std::str::from_utf8(value).is_err() {
        return Err(StoreError::Copy(format!("job {}: {field} is not UTF-8", job.uuid)));
    }
    for &byte in value {
        match byte {
            b'\\' => buf.extend_from_slice(b"\\\\"),
            b'\t' => buf.extend_from_slice(b"\\t"),
            b'\n' => buf.extend_from_slice(b"\\n"),
            b'\r' => buf.extend_from_slice(b"\\r"),
            0 => return Err(StoreError::Copy(format!("job {}: {field} contains NUL", job.uuid))),
            other => buf.push(other),
        }
    }
    Ok(())
}
