pub mod icons;
pub mod progress;
pub mod view;

pub use progress::RunProgress;
pub use view::{print_audit, print_outcome, print_routes, print_run, print_runs};
