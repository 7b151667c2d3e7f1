use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::model::{AdminId, Job, JobNumber, UserId};
use crate::replay::Command;

/// Errors that can occur when reading or writing csv rows
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized operation '{op}'")]
    UnrecognizedOp { line: usize, op: String },

    #[error("line {line}: {op} missing {field}")]
    MissingField {
        line: usize,
        op: String,
        field: &'static str,
    },

    #[error("line {line}: {op} has invalid detail '{detail}'")]
    InvalidDetail {
        line: usize,
        op: String,
        detail: String,
    },

    #[error("failed to write csv: {0}")]
    Write(#[from] csv::Error),

    #[error("failed to flush csv: {0}")]
    Flush(#[from] io::Error),
}

#[derive(Debug, Deserialize)]
struct InputRow {
    op: String,
    at: i64,
    user: Option<UserId>,
    job: Option<JobNumber>,
    admin: Option<AdminId>,
    detail: Option<String>,
}

#[derive(Debug, Serialize)]
struct OutputRow {
    job: JobNumber,
    status: String,
    required: u32,
    reserved: u32,
    confirmed: u32,
    available: u32,
}

impl InputRow {
    fn user(&self, line: usize) -> Result<UserId, CsvError> {
        self.user.ok_or_else(|| self.missing(line, "user"))
    }

    fn job(&self, line: usize) -> Result<JobNumber, CsvError> {
        self.job.ok_or_else(|| self.missing(line, "job"))
    }

    fn admin(&self, line: usize) -> Result<AdminId, CsvError> {
        self.admin.ok_or_else(|| self.missing(line, "admin"))
    }

    fn detail(&self) -> Option<String> {
        self.detail.clone().filter(|d| !d.is_empty())
    }

    fn missing(&self, line: usize, field: &'static str) -> CsvError {
        CsvError::MissingField {
            line,
            op: self.op.clone(),
            field,
        }
    }

    fn into_command(self, line: usize) -> Result<Command, CsvError> {
        let at = self.at;
        let cmd = match self.op.as_str() {
            "create" => {
                let detail = self.detail().ok_or_else(|| self.missing(line, "detail"))?;
                let required = detail.parse().map_err(|_| CsvError::InvalidDetail {
                    line,
                    op: self.op.clone(),
                    detail,
                })?;
                Command::Create {
                    at,
                    admin: self.admin(line)?,
                    required,
                }
            }
            "publish" => Command::Publish {
                at,
                job: self.job(line)?,
            },
            "reserve" => Command::Reserve {
                at,
                user: self.user(line)?,
                job: self.job(line)?,
            },
            "pay" => Command::Pay {
                at,
                user: self.user(line)?,
                receipt: self.detail().ok_or_else(|| self.missing(line, "detail"))?,
            },
            "cancel" => Command::Cancel {
                at,
                user: self.user(line)?,
                job: self.job(line)?,
            },
            "approve" => Command::Approve {
                at,
                admin: self.admin(line)?,
                user: self.user(line)?,
                job: self.job(line)?,
            },
            "reject" => Command::Reject {
                at,
                admin: self.admin(line)?,
                user: self.user(line)?,
                job: self.job(line)?,
                reason: self.detail(),
            },
            "block" => Command::Block {
                at,
                admin: self.admin(line)?,
                user: self.user(line)?,
                job: self.job(line)?,
            },
            "reap" => Command::Reap { at },
            "complete" => Command::Complete {
                at,
                job: self.job(line)?,
            },
            "close" => Command::Close {
                at,
                job: self.job(line)?,
            },
            other => {
                return Err(CsvError::UnrecognizedOp {
                    line,
                    op: other.to_string(),
                });
            }
        };
        Ok(cmd)
    }
}

/// Read commands from a csv file
pub fn read_commands(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<Command, CsvError>>, CsvError> {
    let path = path.as_ref();
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.display().to_string(),
            source,
        })?;

    Ok(reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            row.into_command(line)
        }))
}

/// Write job counters in csv format
pub fn write_jobs<'a>(
    writer: impl io::Write,
    jobs: impl IntoIterator<Item = &'a Job>,
) -> Result<(), CsvError> {
    let mut writer = csv::Writer::from_writer(writer);

    for job in jobs {
        let row = OutputRow {
            job: job.number,
            status: job.status.to_string(),
            required: job.required_workers,
            reserved: job.reserved_slots,
            confirmed: job.confirmed_slots,
            available: job.available(),
        };
        writer.serialize(&row)?;
    }

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobStatus;
    use chrono::Utc;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HEADER: &str = "op,at,user,job,admin,detail\n";

    fn write_csv(rows: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(HEADER.as_bytes()).unwrap();
        file.write_all(rows.as_bytes()).unwrap();
        file
    }

    fn read(rows: &str) -> Vec<Result<Command, CsvError>> {
        let file = write_csv(rows);
        read_commands(file.path()).unwrap().collect()
    }

    #[test]
    fn read_create_and_reserve() {
        let results = read("create,0,,,1,3\nreserve,5,42,1,,\n");
        assert_eq!(results.len(), 2);

        let mut commands = results.into_iter().map(|r| r.unwrap());
        assert_eq!(
            commands.next(),
            Some(Command::Create {
                at: 0,
                admin: 1,
                required: 3
            })
        );
        assert_eq!(
            commands.next(),
            Some(Command::Reserve {
                at: 5,
                user: 42,
                job: 1
            })
        );
    }

    #[test]
    fn read_with_whitespace() {
        let results = read("pay, 30, 42, , , receipt-42\n");
        assert_eq!(
            results[0].as_ref().unwrap(),
            &Command::Pay {
                at: 30,
                user: 42,
                receipt: "receipt-42".into()
            }
        );
    }

    #[test]
    fn reject_reason_is_optional() {
        let results = read("reject,60,42,1,7,\nreject,61,43,1,7,blurry\n");
        assert!(matches!(
            results[0].as_ref().unwrap(),
            Command::Reject { reason: None, .. }
        ));
        assert!(matches!(
            results[1].as_ref().unwrap(),
            Command::Reject { reason: Some(r), .. } if r == "blurry"
        ));
    }

    #[test]
    fn read_returns_error_for_unknown_op() {
        let results = read("refund,0,1,1,,\n");
        let err = results[0].as_ref().unwrap_err();
        assert!(matches!(err, CsvError::UnrecognizedOp { line: 2, .. }));
    }

    #[test]
    fn read_returns_error_for_missing_field() {
        let results = read("reserve,0,,1,,\nreserve,0,1,1,,\napprove,0,1,1,,\n");
        assert!(matches!(
            results[0].as_ref().unwrap_err(),
            CsvError::MissingField {
                line: 2,
                field: "user",
                ..
            }
        ));
        assert!(results[1].is_ok());
        assert!(matches!(
            results[2].as_ref().unwrap_err(),
            CsvError::MissingField {
                line: 4,
                field: "admin",
                ..
            }
        ));
    }

    #[test]
    fn read_returns_error_for_bad_capacity() {
        let results = read("create,0,,,1,many\n");
        assert!(matches!(
            results[0].as_ref().unwrap_err(),
            CsvError::InvalidDetail { line: 2, .. }
        ));
    }

    #[test]
    fn read_returns_error_for_bad_number() {
        let results = read("reserve,soon,1,1,,\n");
        assert!(matches!(
            results[0].as_ref().unwrap_err(),
            CsvError::Parse { line: 2, .. }
        ));
    }

    #[test]
    fn missing_file_is_an_error() {
        let result = read_commands("/nonexistent/commands.csv");
        assert!(matches!(result, Err(CsvError::Open { .. })));
    }

    #[test]
    fn write_job_rows() {
        let mut job = Job::draft(1, 3, 1, Utc::now());
        job.status = JobStatus::Active;
        job.reserved_slots = 1;
        job.confirmed_slots = 1;

        let mut out = Vec::new();
        write_jobs(&mut out, [&job]).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "job,status,required,reserved,confirmed,available\n1,active,3,1,1,1\n"
        );
    }
}
