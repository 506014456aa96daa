pub mod keithley6485;
pub mod mock;
pub mod transport;

pub use keithley6485::{
    AcquisitionRequest, AcquisitionResult, CurrentRange, FormatElements, Keithley6485,
    Keithley6485Error,
};
pub use mock::MockTransport;
pub use transport::{SerialTransport, Transport};
