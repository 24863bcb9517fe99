mod build;
mod dockerfile;
mod doctor;
mod images;
mod init;
mod launch;

pub use build::build;
pub use dockerfile::dockerfile;
pub use doctor::doctor;
pub use images::{images, inspect};
pub use init::init_project;
pub use launch::launch;
