pub mod data;

use crate::config::BurstSettings;
use crate::devices::{AcquisitionResult, Keithley6485, Keithley6485Error, Transport};
use chrono::Utc;
use csv::Writer;
use data::BurstRecord;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum ExperimentError {
    #[error("Device error: {0}")]
    Device(#[from] Keithley6485Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid burst settings: {0}")]
    InvalidSettings(String),
}

/// What a completed burst produced
#[derive(Debug)]
pub struct BurstOutcome {
    pub id: String,
    pub result: AcquisitionResult,
    pub path: PathBuf,
}

/// Identify, reset, run one burst and save it to CSV.
///
/// The session is left open; disconnecting is up to the caller.
pub fn run_burst<T: Transport>(
    pico: &mut Keithley6485<T>,
    settings: &BurstSettings,
) -> Result<BurstOutcome, ExperimentError> {
    info!("Starting burst with settings: {:?}", settings);

    if settings.discard_first && settings.samples < 2 {
        error!("Burst of {} points would be empty after discarding the first", settings.samples);
        return Err(ExperimentError::InvalidSettings(format!(
            "discard_first needs at least 2 samples, got {}",
            settings.samples
        )));
    }

    let id = pico.identify().map_err(|e| {
        error!("Failed to identify instrument: {}", e);
        e
    })?;
    info!("Instrument: {}", id);

    pico.reset()?;

    let request = settings.request();
    let mut result = pico.acquire(&request).map_err(|e| {
        error!("Burst acquisition failed: {}", e);
        e
    })?;
    let acquired_at = Utc::now().to_rfc3339();

    if settings.discard_first {
        warn!("Discarding first trace point");
        result.discard_first();
    }

    let records = to_records(&result, &acquired_at, settings.discard_first);
    let path = save_burst_to_csv(&records, &settings.output_dir)?;
    info!("Burst completed. {} points saved to {}", records.len(), path.display());

    Ok(BurstOutcome { id, result, path })
}

fn to_records(result: &AcquisitionResult, timestamp: &str, skipped_first: bool) -> Vec<BurstRecord> {
    let offset = usize::from(skipped_first);
    result
        .readings
        .iter()
        .enumerate()
        .map(|(i, &current_a)| BurstRecord {
            timestamp: timestamp.to_string(),
            index: i + offset,
            time_s: result.timestamps.as_ref().map(|t| t[i]),
            current_a,
            status: result.status.as_ref().map(|s| s[i]),
        })
        .collect()
}

/// Save the burst to a timestamped CSV file inside `dir`
fn save_burst_to_csv(data: &[BurstRecord], dir: &Path) -> Result<PathBuf, ExperimentError> {
    let file_name = chrono::Local::now()
        .format("burst_data_%Y-%m-%d_%H-%M-%S.csv")
        .to_string();

    std::fs::create_dir_all(dir)?;
    let path = dir.join(file_name);

    let file = File::create(&path)?;
    let mut writer = Writer::from_writer(file);
    for record in data {
        writer.serialize(record)?;
    }
    writer.flush()?;

    info!("Burst saved to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{FormatElements, MockTransport};

    fn instrument(trace: &str) -> Keithley6485<MockTransport> {
        let mock = MockTransport::new()
            .respond("*IDN?", "KEITHLEY INSTRUMENTS INC.,MODEL 6485,1234567,B03")
            .respond("*OPC?", "1")
            .respond("TRAC:DATA?", trace);
        Keithley6485::with_transport("mock", mock)
    }

    #[test]
    fn burst_is_saved_without_first_point() {
        let dir = tempfile::tempdir().unwrap();
        let settings = BurstSettings {
            samples: 3,
            nplc: 0.1,
            output_dir: dir.path().to_path_buf(),
            ..BurstSettings::default()
        };
        let mut pico = instrument("9.9E-9,1.0E-9,2.0E-9");

        let outcome = run_burst(&mut pico, &settings).unwrap();
        assert!(outcome.id.contains("6485"));
        assert_eq!(outcome.result.readings, vec![1.0e-9, 2.0e-9]);
        assert!(pico.is_connected());

        let mut reader = csv::Reader::from_path(&outcome.path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            vec!["timestamp", "index", "time_s", "current_A", "status"]
        );
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][1], "1");
        assert_eq!(rows[0][3].parse::<f64>().unwrap(), 1.0e-9);
        assert_eq!(&rows[0][2], "");
    }

    #[test]
    fn triplet_burst_keeps_time_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let settings = BurstSettings {
            samples: 2,
            elements: FormatElements::ReadingTimeStatus,
            discard_first: false,
            output_dir: dir.path().join("nested"),
            ..BurstSettings::default()
        };
        let mut pico = instrument("1.0E-9A,0.0,0.0,2.0E-9A,0.02,4.0");

        let outcome = run_burst(&mut pico, &settings).unwrap();
        let mut reader = csv::Reader::from_path(&outcome.path).unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[1][1], "1");
        assert_eq!(rows[1][2].parse::<f64>().unwrap(), 0.02);
        assert_eq!(&rows[1][4], "4");
    }

    #[test]
    fn single_sample_with_discard_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let settings = BurstSettings {
            samples: 1,
            output_dir: dir.path().join("out"),
            ..BurstSettings::default()
        };
        let mock = MockTransport::new()
            .respond("*IDN?", "KEITHLEY INSTRUMENTS INC.,MODEL 6485,1234567,B03")
            .respond("*OPC?", "1")
            .respond("TRAC:DATA?", "1.0E-9");
        let state = mock.state();
        let mut pico = Keithley6485::with_transport("mock", mock);

        let err = run_burst(&mut pico, &settings).unwrap_err();
        assert!(matches!(err, ExperimentError::InvalidSettings(_)), "{err}");
        assert!(state.borrow().written.is_empty());
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn single_sample_without_discard_is_saved() {
        let dir = tempfile::tempdir().unwrap();
        let settings = BurstSettings {
            samples: 1,
            discard_first: false,
            output_dir: dir.path().to_path_buf(),
            ..BurstSettings::default()
        };
        let mut pico = instrument("1.0E-9");

        let outcome = run_burst(&mut pico, &settings).unwrap();
        assert_eq!(outcome.result.readings, vec![1.0e-9]);
        let mut reader = csv::Reader::from_path(&outcome.path).unwrap();
        assert_eq!(reader.records().count(), 1);
    }

    #[test]
    fn failed_acquisition_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let settings = BurstSettings {
            samples: 5,
            output_dir: dir.path().join("out"),
            ..BurstSettings::default()
        };
        let mut pico = instrument("1.0E-9,2.0E-9");

        let err = run_burst(&mut pico, &settings).unwrap_err();
        assert!(matches!(err, ExperimentError::Device(Keithley6485Error::Parse(_))));
        assert!(!dir.path().join("out").exists());
    }
}
