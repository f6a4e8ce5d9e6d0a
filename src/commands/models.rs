use lembed_core::{registry, SharedRegistry};

pub fn run(shared: &SharedRegistry) -> anyhow::Result<()> {
    let registry = registry::lock(shared)?;

    if registry.is_empty() {
        println!("No models registered. Use `lembed --model NAME=PATH ...` to load one.");
        return Ok(());
    }

    println!("{:<16} {:>12} {:>6}  PATH", "NAME", "SIZE", "WIDTH");
    for (_, entry) in registry.enumerate() {
        println!(
            "{:<16} {:>12} {:>6}  {}",
            entry.name(),
            entry.size_bytes(),
            entry.embedding_width(),
            entry.path().display()
        );
    }

    Ok(())
}
