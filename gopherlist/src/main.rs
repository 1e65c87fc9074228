//! `gopherlist`: emits a gopher menu for the current directory, driven
//! entirely by the CGI environment (§4.6). Grounded on `gopherlist.c`,
//! generalized with the fuller suffix table and the query-echo/parent-line
//! additions from the expanded specification.

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};

use reactor::WriteBuffer;

fn main() {
    let Ok(script_name) = std::env::var("SCRIPT_NAME") else { return };
    let Ok(hostname) = std::env::var("SERVER_NAME") else { return };
    let Ok(port) = std::env::var("SERVER_PORT") else { return };
    let query = std::env::var("QUERY_STRING").unwrap_or_default();

    let Ok(cwd) = std::env::current_dir() else { return };
    let Ok(entries) = fs::read_dir(&cwd) else { return };

    let selector = normalize_selector(&script_name);

    let mut out = WriteBuffer::new(1, 64 * 1024, 1000);

    out.push(format_args!(
        "iDirectory listing of {hostname}{selector}\t\t{hostname}\t{port}\r\n"
    ));

    if !query.is_empty() {
        out.push(format_args!("i{query}\t\t{hostname}\t{port}\r\n"));
    }

    if let Some(parent) = parent_selector(&selector) {
        out.push(format_args!("1..\t{parent}\t{hostname}\t{port}\r\n"));
    }

    let mut names: Vec<String> = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with('.') {
            continue;
        }
        names.push(name.to_string());
    }
    names.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));

    for name in &names {
        let Ok(metadata) = fs::metadata(name) else { continue };
        let mode = metadata.permissions().mode();

        let Some(type_code) = classify(&metadata, mode, name) else { continue };

        let file_selector = format!("{selector}{name}");
        out.push(format_args!("{type_code}{name}\t{file_selector}\t{hostname}\t{port}\r\n"));
        let _ = out.check_flush(256);
    }

    out.push(format_args!(".\r\n"));
    let _ = out.flush();
}

/// World-readable is required of every listed entry; directories
/// additionally require world-execute. Matches `gopherlist.c`'s `S_IROTH`
/// and `S_ISDIR(...) && S_IXOTH` checks.
fn classify(metadata: &fs::Metadata, mode: u32, name: &str) -> Option<char> {
    if mode & libc::S_IROTH == 0 {
        return None;
    }

    if metadata.is_dir() {
        return (mode & libc::S_IXOTH != 0).then_some('1');
    }

    if !metadata.is_file() {
        return None;
    }

    if mode & libc::S_IXOTH != 0 {
        return Some('7');
    }

    Some(classify_extension(name))
}

fn classify_extension(name: &str) -> char {
    let Some(ext) = name.rsplit('.').next().filter(|_| name.contains('.')) else {
        return '9';
    };
    let ext = ext.to_ascii_lowercase();

    match ext.as_str() {
        "gif" => 'g',
        "bmp" | "jpg" | "jpeg" | "png" | "pcx" | "tif" | "tiff" => 'I',
        "mp3" | "ogg" | "wav" => 's',
        "htm" | "html" => 'h',
        "c" | "cpp" | "h" | "txt" => '0',
        _ => '9',
    }
}

/// Trims extra slashes out of the selector, the way `gopherlist.c` does,
/// and ensures it begins and ends with exactly one slash.
fn normalize_selector(script_name: &str) -> String {
    let mut out = String::from("/");
    for segment in script_name.split('/') {
        if segment.is_empty() {
            continue;
        }
        out.push_str(segment);
        out.push('/');
    }
    out
}

/// `None` at the content root (no parent to go up to).
fn parent_selector(selector: &str) -> Option<String> {
    let trimmed = selector.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    trimmed.rfind('/').map(|idx| trimmed[..=idx].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_suffixes() {
        assert_eq!(classify_extension("photo.jpg"), 'I');
        assert_eq!(classify_extension("anim.gif"), 'g');
        assert_eq!(classify_extension("song.mp3"), 's');
        assert_eq!(classify_extension("page.html"), 'h');
        assert_eq!(classify_extension("notes.txt"), '0');
        assert_eq!(classify_extension("data.bin"), '9');
        assert_eq!(classify_extension("noext"), '9');
    }

    #[test]
    fn normalizes_selector_with_redundant_slashes() {
        assert_eq!(normalize_selector("/a//b/"), "/a/b/");
        assert_eq!(normalize_selector(""), "/");
    }

    #[test]
    fn parent_selector_is_none_at_root() {
        assert_eq!(parent_selector("/"), None);
        assert_eq!(parent_selector("/a/"), Some("/".to_string()));
        assert_eq!(parent_selector("/a/b/"), Some("/a/".to_string()));
    }
}
