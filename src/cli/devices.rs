pub fn cmd_devices() {
    let adapters = kiln::gpu::list_adapters();
    if adapters.is_empty() {
        eprintln!("No GPU adapters found.");
        return;
    }
    for entry in adapters {
        match (entry.ordinal, entry.skipped) {
            (Some(n), _) => println!("gpu:{:<3} {}", n, entry.summary),
            (None, Some(reason)) => println!("  -     {} (skipped: {})", entry.summary, reason),
            (None, None) => println!("  -     {}", entry.summary),
        }
    }
}
