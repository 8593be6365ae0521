//! `prism factories` — list the available fusion factories.

use prism_core::catalog::FusionCatalog;

use super::truncate;

pub async fn list() -> Result<(), String> {
    let catalog = FusionCatalog::builtin();
    let summaries = catalog.list();

    println!("┌──────────────┬──────────────┬───────┬──────────────────────────────────────────┐");
    println!("│ ID           │ Label        │ Steps │ Description                              │");
    println!("├──────────────┼──────────────┼───────┼──────────────────────────────────────────┤");
    for summary in &summaries {
        println!(
            "│ {:<12} │ {:<12} │ {:<5} │ {:<40} │",
            truncate(&summary.factory_id, 12),
            truncate(&summary.short_label, 12),
            summary.steps,
            truncate(&summary.description, 40),
        );
    }
    println!("└──────────────┴──────────────┴───────┴──────────────────────────────────────────┘");
    println!();
    println!(
        "Use with: prism run \"your prompt\" --factory <id>, or register your own via --factory-file"
    );
    Ok(())
}
