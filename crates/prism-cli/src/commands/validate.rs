//! `prism validate` — check a factory YAML file without running it.

use prism_core::catalog::{FactoryFile, Instruction};

pub async fn run(file: &str) -> Result<(), String> {
    let factory = FactoryFile::from_file(file)
        .and_then(FactoryFile::into_factory)
        .map_err(|e| e.to_string())?;

    let instructions = factory.instantiate();
    println!("✅ Factory '{}' is valid", factory.factory_id);
    println!("   Label: {}", factory.short_label);
    println!("   Steps: {}", instructions.len());

    for (i, instruction) in instructions.iter().enumerate() {
        let kind = match instruction {
            Instruction::Gather { .. } => "gather",
            Instruction::Checklist { .. } => "user-input-checklist",
            Instruction::FreeText { .. } => "user-input-text",
        };
        println!("   {}. {} ({})", i + 1, instruction.label(), kind);
    }
    Ok(())
}
