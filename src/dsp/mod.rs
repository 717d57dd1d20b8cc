//! Signal-processing core: decimation, double integration, rainflow
//! counting, S-N fatigue, and display spectra.

pub mod decimate;
pub mod fatigue;
pub mod integrate;
pub mod rainflow;
pub mod spectrum;

pub use decimate::{decimation_factor, Decimator};
pub use fatigue::{asme_sn_cycles, build_sn_curve, directional_damage, fatigue_from_accel};
pub use integrate::{acc_to_disp, DispMethod};
pub use rainflow::rainflow_ranges_counts;
