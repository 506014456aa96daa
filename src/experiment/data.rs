use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct BurstRecord {
    pub timestamp: String,   // UTC ISO timestamp of the acquisition
    pub index: usize,        // position in the trace buffer
    pub time_s: Option<f64>, // instrument timestamp, if requested
    #[serde(rename = "current_A")]
    pub current_a: f64,
    pub status: Option<u32>,
}
