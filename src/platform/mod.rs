//! Platform description handed over by the boot glue.

pub mod dt;
