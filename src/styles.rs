use camino::Utf8Path;
use thiserror::Error;

/// Errors that can occur when compiling stylesheets.
#[derive(Debug, Error)]
pub enum CompileError {
    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A Sass compilation error occurred.
    #[cfg(feature = "grass")]
    #[error("Sass compilation error: {0}")]
    Sass(#[from] Box<grass::Error>),

    #[error("Stylesheet '{0}' can't be compiled, tsumiki was built without the `grass` feature")]
    Unsupported(camino::Utf8PathBuf),
}

/// Compiles an SCSS entry stylesheet to CSS. Imports are resolved relative
/// to the entry file.
pub fn compile(entry: &Utf8Path) -> Result<String, CompileError> {
    compile_with(entry, false)
}

/// Same as [`compile`], with compressed output for production.
pub fn compile_compressed(entry: &Utf8Path) -> Result<String, CompileError> {
    compile_with(entry, true)
}

#[cfg(feature = "grass")]
fn compile_with(entry: &Utf8Path, compressed: bool) -> Result<String, CompileError> {
    if !entry.is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("stylesheet not found: {entry}"),
        )
        .into());
    }

    let style = match compressed {
        true => grass::OutputStyle::Compressed,
        false => grass::OutputStyle::Expanded,
    };

    let css = grass::from_path(entry, &grass::Options::default().style(style))?;
    Ok(css)
}

#[cfg(not(feature = "grass"))]
fn compile_with(entry: &Utf8Path, _: bool) -> Result<String, CompileError> {
    Err(CompileError::Unsupported(entry.to_path_buf()))
}

#[cfg(all(test, feature = "grass"))]
mod tests {
    use super::*;

    use camino::Utf8PathBuf;

    #[test]
    fn compiles_variables_and_partials() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        std::fs::write(root.join("_colors.scss"), "$accent: #ff0000;\n").unwrap();
        std::fs::write(
            root.join("app.scss"),
            "@import 'colors';\n.button { color: $accent; }\n",
        )
        .unwrap();

        let css = compile(&root.join("app.scss")).unwrap();
        assert!(css.contains(".button"));
        assert!(css.contains("color: #ff0000"));

        let compressed = compile_compressed(&root.join("app.scss")).unwrap();
        assert!(compressed.len() < css.len());
    }

    #[test]
    fn syntax_errors_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        std::fs::write(root.join("broken.scss"), ".a { color: $undefined; }\n").unwrap();

        let err = compile(&root.join("broken.scss")).unwrap_err();
        assert!(matches!(err, CompileError::Sass(_)));
    }

    #[test]
    fn missing_entry_is_an_io_error() {
        let err = compile(Utf8Path::new("/definitely/not/here.scss")).unwrap_err();
        assert!(matches!(err, CompileError::Io(_)));
    }
}
