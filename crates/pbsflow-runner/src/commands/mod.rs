use pbsflow_client::targets::PbsCli;
use pbsflow_core::config::Config;

pub mod cancel;
pub mod managed;
pub mod run;
pub mod status;

pub(crate) fn pbs_from_config(config: &Config) -> PbsCli {
    PbsCli::from_env(config.submit.max_retries)
}
