//! `cadenza check`: validate a configuration without starting anything.

use cadenza_config::AppConfig;
use cadenza_core::OpKind;
use cadenza_operations::BackendTable;

pub fn run(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Checking configuration '{}'...", config.current_config);

    config.validate()?;
    println!("   ✅ Config is valid");

    let table = BackendTable::with_builtins();
    let mut missing = Vec::new();
    for spec in &config.operations {
        if table.contains(spec.role.kind(), &spec.id) {
            println!("   ✅ {} {}", spec.role, spec.id);
        } else {
            println!("   ❌ {} {}: no such {} operation", spec.role, spec.id, spec.role.kind());
            missing.push(format!("{}/{}", spec.role, spec.id));
        }
    }

    let prompter = &config.prompter;
    for path in [
        prompter.instruction_path(),
        prompter.character_path(),
        prompter.scene_path(),
    ] {
        if path.is_file() {
            println!("   ✅ Prompt {}", path.display());
        } else {
            println!("   ⚠️  Prompt {} is missing", path.display());
        }
    }

    println!();
    println!("   Tool servers: {}", config.mcp.len());
    for kind in OpKind::ALL {
        println!("   {:<13} {}", kind.as_str(), table.ids(kind).join(", "));
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(format!("unknown operations: {}", missing.join(", ")).into())
    }
}
