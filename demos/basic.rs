use std::sync::Arc;

use flags_admin::tracker::VariantField;
use flags_admin::flag::VariantType;
use flags_admin::{Client, Editor, EditorState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // Base URL and retries can also come from FLAGS_ADMIN_* variables
    let client = Client::builder()
        .with_base_url("http://localhost:8080/admin")
        .with_env()
        .build()?;

    let mut editor = Editor::new(Arc::new(client));
    let mut deleted = editor.subscribe();

    editor.load("my-flag-id").await?;
    if let Some(flag) = editor.flag() {
        println!("Editing {} ({} variants, {} rules)", flag.key, flag.variants.len(), flag.rules.len());
    }

    // Add a numeric variant and a rule that serves it
    let variant = editor.add_variant()?;
    editor.update_variant(&variant, VariantField::Type(VariantType::Number))?;
    editor.update_variant(&variant, VariantField::Value("42".to_string()))?;
    editor.add_rule(&variant)?;

    match editor.save().await {
        Ok(outcome) => println!("Saved {} changes", outcome.applied),
        Err(e) => println!("Save failed, nothing was discarded: {}", e),
    }

    while let Ok(event) = deleted.try_recv() {
        println!("Deleted {:?} {}", event.kind, event.id);
    }

    if editor.state() == &EditorState::Redirecting {
        println!("Back to the flag list");
    }

    Ok(())
}
