pub mod check_config;
pub mod dry_run;
