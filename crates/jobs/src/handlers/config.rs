use cadenza_config::AppConfig;
use serde_json::json;

use super::Services;
use crate::job::{ConfigNameArgs, ConfigUpdateArgs};
use crate::scheduler::JobScope;

type Result = cadenza_core::Result<()>;

// Config jobs change the stored configuration only. Loaded operations follow
// it on the next `operation_reload_from_config`.

pub(super) fn load(services: &Services, scope: &JobScope, args: ConfigNameArgs) -> Result {
    scope.start(json!({ "config_name": args.config_name }));
    let config_dir = services.config().config_dir.clone();
    let loaded = AppConfig::load_named(&config_dir, &args.config_name)?;
    *services.config_mut() = loaded;
    Ok(())
}

pub(super) fn update(services: &Services, scope: &JobScope, args: ConfigUpdateArgs) -> Result {
    scope.start(json!({ "config_d": args.config_d }));
    services
        .config_mut()
        .apply_update(&serde_json::Value::Object(args.config_d))?;
    Ok(())
}

pub(super) fn save(services: &Services, scope: &JobScope, args: ConfigNameArgs) -> Result {
    scope.start(json!({ "config_name": args.config_name }));
    let path = services.config_mut().save_named(&args.config_name)?;
    scope.progress(json!({ "config_name": args.config_name, "path": path }));
    Ok(())
}
