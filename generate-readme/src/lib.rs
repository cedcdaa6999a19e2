/*!
Generates a README.md file for a crate from its doc comments, using
[cargo-readme](https://crates.io/crates/cargo-readme) and the crate's
`README.tpl` template. Intended to be called from a `build.rs` file:

```rust,ignore
fn main() {
    generate_readme::from_main().unwrap();
}
```

Set `SKIP_README` in the environment to skip regeneration, for builds from
a read-only source tree.
*/

use std::env;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

/// Generate README.md from the docs in src/main.rs.
pub fn from_main() -> io::Result<()> {
    generate(PathBuf::from("src/main.rs"))
}

/// Generate README.md from the docs in src/lib.rs.
pub fn from_lib() -> io::Result<()> {
    generate(PathBuf::from("src/lib.rs"))
}

fn generate(source: PathBuf) -> io::Result<()> {
    if env::var_os("SKIP_README").is_some() {
        return Ok(());
    }

    let mut source = File::open(source)?;
    let mut template = File::open("README.tpl")?;

    let content = cargo_readme::generate_readme(
        &env::current_dir()?,
        &mut source,
        Some(&mut template),
        // The "add title" etc. arguments are template concerns here.
        cargo_readme::ReadmeOptions {
            add_title: false,
            add_badges: false,
            add_license: false,
            indent_headings: false,
            ..Default::default()
        },
    )
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    let mut readme = File::create("README.md")?;
    readme.write_all(content.as_bytes())
}
