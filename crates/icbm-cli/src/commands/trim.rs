use std::path::Path;

pub fn run(file: &Path, lines: usize) {
    match icbm_core::trim_to_last_lines(file, lines) {
        Ok(()) => println!("{} now holds at most its last {lines} lines", file.display()),
        Err(e) => {
            eprintln!("Trim failed: {e}");
            std::process::exit(1);
        }
    }
}
