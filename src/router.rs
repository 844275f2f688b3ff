use crate::catalog::Catalog;
use crate::request::Request;
use crate::text;
use matchit::Router as PathRouter;
use std::io;
use std::sync::OnceLock;

/// Gemini status codes this responder ever emits (§4.E).
mod status {
    pub const INPUT: u8 = 10;
    pub const SUCCESS: u8 = 20;
    pub const TEMPORARY_FAILURE: u8 = 42;
    pub const NOT_FOUND: u8 = 51;
    pub const BAD_REQUEST: u8 = 59;
}

/// Which handler a `path_info` resolves to (§4.E's routing table). Carried
/// as a plain enum rather than `matchit`'s captured params: every handler
/// re-derives what it needs from `path_info` itself, so all the route table
/// contributes is match precedence between the fixed routes and the `/*`
/// catch-all.
#[derive(Clone, Copy)]
enum Route {
    Home,
    Search,
    Categories,
    Port,
}

/// Built once per process: `/`, `/search` and `/all` are registered as
/// static routes, which `matchit` prefers over the `/{*rest}` catch-all that
/// falls through to `port` (and, from there, to `listing`) for everything
/// else — matching the routing table's precedence exactly.
fn routes() -> &'static PathRouter<Route> {
    static ROUTES: OnceLock<PathRouter<Route>> = OnceLock::new();
    ROUTES.get_or_init(|| {
        let mut router = PathRouter::new();
        router.insert("/", Route::Home).unwrap();
        router.insert("/search", Route::Search).unwrap();
        router.insert("/all", Route::Categories).unwrap();
        router.insert("/{*rest}", Route::Port).unwrap();
        router
    })
}

/// Dispatches a fully-parsed request to the matching handler and streams
/// its response through the request's output buffer.
///
/// Returns the FastCGI `app_status` to close the request with; the caller
/// is responsible for flushing `req.out` and emitting `END_REQUEST`.
pub fn dispatch(req: &mut Request, catalog: &Catalog, sink: &mut Vec<u8>) -> io::Result<u8> {
    let path = req.path_info_or_default().to_string();
    let script = req.script_name_or_default().to_string();

    match routes().at(&path) {
        Ok(matched) => match matched.value {
            Route::Home => home(req, &script, sink),
            Route::Search => search(req, catalog, &script, sink),
            Route::Categories => categories(req, catalog, &script, sink),
            Route::Port => port(req, catalog, &path, &script, sink),
        },
        Err(_) => not_found(req, sink),
    }
}

fn not_found(req: &mut Request, sink: &mut Vec<u8>) -> io::Result<u8> {
    write_status(req, sink, status::NOT_FOUND, "not found")?;
    Ok(0)
}

fn write_status(req: &mut Request, sink: &mut Vec<u8>, code: u8, meta: &str) -> io::Result<()> {
    req.out.append_fmt(format_args!("{code:02} {meta}\r\n"), sink)
}

fn home(req: &mut Request, script: &str, sink: &mut Vec<u8>) -> io::Result<u8> {
    write_status(req, sink, status::SUCCESS, "text/gemini")?;
    req.out.append_fmt(
        format_args!(
            "# pkg_fcgi\n\n\
             Welcome to pkg_fcgi, the Gemini interface for the OpenBSD ports collection.\n\n\
             => {script}search Search for a package\n\
             => {script}all All categories\n\n\
             What you search will be matched against the package name (pkgstem), comment, DESCR and maintainer.\n"
        ),
        sink,
    )?;
    Ok(0)
}

fn search(req: &mut Request, catalog: &Catalog, script: &str, sink: &mut Vec<u8>) -> io::Result<u8> {
    let raw_query = req.query_string_or_default().to_string();
    if raw_query.is_empty() {
        write_status(req, sink, status::INPUT, "search for a package")?;
        return Ok(0);
    }

    let decoded = match text::unquote(&raw_query) {
        Ok(d) => d,
        Err(()) => {
            write_status(req, sink, status::BAD_REQUEST, "bad request")?;
            return Ok(1);
        }
    };

    let escaped = match text::fts_escape(&decoded) {
        Ok(e) => e,
        Err(()) => {
            write_status(req, sink, status::BAD_REQUEST, "bad request")?;
            return Ok(1);
        }
    };

    let rows = match catalog.search(&escaped) {
        Ok(rows) => rows,
        Err(_) => {
            write_status(req, sink, status::TEMPORARY_FAILURE, "internal error")?;
            return Ok(1);
        }
    };

    write_status(req, sink, status::SUCCESS, "text/gemini")?;
    req.out
        .append_fmt(format_args!("# search results for {decoded}\n\n"), sink)?;

    if rows.is_empty() {
        req.out.append(b"No ports found\n", sink)?;
    } else {
        for row in rows {
            req.out.append_fmt(
                format_args!(
                    "=> {script}{path} {stem}: {comment}\n",
                    path = row.fullpkgpath,
                    stem = row.pkgstem,
                    comment = row.comment,
                ),
                sink,
            )?;
        }
    }
    Ok(0)
}

fn categories(req: &mut Request, catalog: &Catalog, script: &str, sink: &mut Vec<u8>) -> io::Result<u8> {
    let rows = match catalog.categories() {
        Ok(rows) => rows,
        Err(_) => {
            write_status(req, sink, status::TEMPORARY_FAILURE, "internal error")?;
            return Ok(1);
        }
    };

    write_status(req, sink, status::SUCCESS, "text/gemini")?;
    req.out.append(b"# list of all categories\n\n", sink)?;
    for category in rows {
        req.out
            .append_fmt(format_args!("=> {script}{category} {category}\n"), sink)?;
    }
    Ok(0)
}

fn port(
    req: &mut Request,
    catalog: &Catalog,
    path: &str,
    script: &str,
    sink: &mut Vec<u8>,
) -> io::Result<u8> {
    let fullpkgpath = path.trim_start_matches('/');

    let details = match catalog.details(fullpkgpath) {
        Ok(details) => details,
        Err(_) => {
            write_status(req, sink, status::TEMPORARY_FAILURE, "internal error")?;
            return Ok(1);
        }
    };

    let Some(details) = details else {
        return listing(req, catalog, path, script, sink);
    };

    let version = text::pkgname_version(&details.pkgname);

    write_status(req, sink, status::SUCCESS, "text/gemini")?;
    match version {
        Some(v) => req
            .out
            .append_fmt(format_args!("# {path} v{v}\n\n"), sink)?,
        None => req
            .out
            .append_fmt(format_args!("# {path} v unknown\n\n"), sink)?,
    }

    req.out.append_fmt(
        format_args!(
            "``` Command to install the package {stem}\n# pkg_add {stem}\n```\n\n",
            stem = details.pkgstem
        ),
        sink,
    )?;

    req.out
        .append_fmt(format_args!("> {}\n\n", details.comment), sink)?;

    req.out.append_fmt(
        format_args!(
            "=> https://cvsweb.openbsd.org/ports/{} CVS Web\n",
            details.fullpkgpath
        ),
        sink,
    )?;

    if !details.homepage.is_empty() {
        req.out.append_fmt(
            format_args!("=> {} Port Homepage (WWW)\n", details.homepage),
            sink,
        )?;
    }

    req.out.append_fmt(
        format_args!(
            "Maintainer: {}\n\n",
            text::obfuscate_maintainer(&details.maintainer_email)
        ),
        sink,
    )?;

    req.out.append_fmt(
        format_args!(
            "## Description\n\n``` {stem} description\n{descr}\n```\n",
            stem = details.pkgstem,
            descr = details.descr,
        ),
        sink,
    )?;

    if let Some(readme) = details.readme.filter(|r| !r.is_empty()) {
        req.out.append_fmt(
            format_args!(
                "\n## Readme\n\n``` README for {stem}\n{readme}\n```\n",
                stem = details.pkgstem,
            ),
            sink,
        )?;
    }

    Ok(0)
}

/// Iteratively strips everything after the last `/` of `path`, leaving
/// only the first segment — the bare category name (§4.E).
fn bare_category(path: &str) -> &str {
    let trimmed = path.trim_start_matches('/');
    match trimmed.find('/') {
        Some(idx) => &trimmed[..idx],
        None => trimmed,
    }
}

fn listing(
    req: &mut Request,
    catalog: &Catalog,
    path: &str,
    script: &str,
    sink: &mut Vec<u8>,
) -> io::Result<u8> {
    let category = bare_category(path);

    let rows = match catalog.paths_in_category(category) {
        Ok(rows) => rows,
        Err(_) => {
            write_status(req, sink, status::TEMPORARY_FAILURE, "internal error")?;
            return Ok(1);
        }
    };

    write_status(req, sink, status::SUCCESS, "text/gemini")?;
    req.out
        .append_fmt(format_args!("# port(s) under {path}\n\n"), sink)?;

    for fullpkgpath in rows {
        req.out.append_fmt(
            format_args!("=> {script}{fullpkgpath} {fullpkgpath}\n"),
            sink,
        )?;
    }

    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Request;

    fn seed(catalog: &Catalog) {
        catalog
            .raw_connection()
            .execute_batch(
                "
                insert into _paths (id, fullpkgpath) values (1, 'editors/vim');
                insert into _ports (fullpkgpath, pkgstem, comment, pkgname, maintainer, homepage)
                    values (1, 'vim', 'vi IMproved', 'tmux-3.4', 1, '');
                insert into _descr (fullpkgpath, value) values (1, 'Vim is a text editor.');
                insert into _email (keyref, value) values (1, 'Jane Doe <jane@example.org>');
                insert into categories (value, fullpkgpath) values ('editors', 'editors/vim');
                insert into webpkg_fts (id, pkgstem, comment) values (1, 'vim', 'vi IMproved');
                ",
            )
            .unwrap();
    }

    fn make_request(path: &str, query: &str) -> Request {
        let mut req = Request::new(1);
        req.apply_param(b"SCRIPT_NAME", b"/app");
        req.apply_param(b"GEMINI_URL_PATH", path.as_bytes());
        if !query.is_empty() {
            req.apply_param(b"QUERY_STRING", query.as_bytes());
        }
        req
    }

    #[test]
    fn home_links_use_script_name() {
        let catalog = Catalog::open_in_memory_for_test().unwrap();
        let mut req = make_request("/", "");
        let mut sink = vec![];
        let status = dispatch(&mut req, &catalog, &mut sink).unwrap();
        req.out.flush(&mut sink).unwrap();
        assert_eq!(status, 0);
        let body = String::from_utf8(sink).unwrap();
        assert!(body.starts_with("20 text/gemini\r\n# pkg_fcgi\n"));
        assert!(body.contains("=> /app/search Search for a package\n"));
        assert!(body.contains("=> /app/all All categories\n"));
    }

    #[test]
    fn empty_search_prompts() {
        let catalog = Catalog::open_in_memory_for_test().unwrap();
        let mut req = make_request("/search", "");
        let mut sink = vec![];
        let status = dispatch(&mut req, &catalog, &mut sink).unwrap();
        req.out.flush(&mut sink).unwrap();
        assert_eq!(status, 0);
        assert_eq!(sink, b"10 search for a package\r\n");
    }

    #[test]
    fn bad_percent_encoding_is_rejected() {
        let catalog = Catalog::open_in_memory_for_test().unwrap();
        let mut req = make_request("/search", "%ZZ");
        let mut sink = vec![];
        let status = dispatch(&mut req, &catalog, &mut sink).unwrap();
        req.out.flush(&mut sink).unwrap();
        assert_eq!(status, 1);
        assert_eq!(sink, b"59 bad request\r\n");
    }

    #[test]
    fn search_returns_matching_rows() {
        let catalog = Catalog::open_in_memory_for_test().unwrap();
        seed(&catalog);
        let mut req = make_request("/search", "vim");
        let mut sink = vec![];
        let status = dispatch(&mut req, &catalog, &mut sink).unwrap();
        req.out.flush(&mut sink).unwrap();
        assert_eq!(status, 0);
        let body = String::from_utf8(sink).unwrap();
        assert!(body.contains("=> /app/editors/vim vim: vi IMproved\n"));
    }

    #[test]
    fn unknown_port_falls_back_to_listing() {
        let catalog = Catalog::open_in_memory_for_test().unwrap();
        let mut req = make_request("/does/not/exist", "");
        let mut sink = vec![];
        let status = dispatch(&mut req, &catalog, &mut sink).unwrap();
        req.out.flush(&mut sink).unwrap();
        assert_eq!(status, 0);
        assert_eq!(
            sink,
            b"20 text/gemini\r\n# port(s) under /does/not/exist\n\n".to_vec()
        );
    }

    #[test]
    fn known_port_renders_details_with_version() {
        let catalog = Catalog::open_in_memory_for_test().unwrap();
        seed(&catalog);
        let mut req = make_request("/editors/vim", "");
        let mut sink = vec![];
        let status = dispatch(&mut req, &catalog, &mut sink).unwrap();
        req.out.flush(&mut sink).unwrap();
        assert_eq!(status, 0);
        let body = String::from_utf8(sink).unwrap();
        assert!(body.contains("# /editors/vim v3.4\n"));
        assert!(body.contains("Maintainer: Jane Doe <jane at example dot org>\n"));
    }

    #[test]
    fn categories_route_lists_distinct_values() {
        let catalog = Catalog::open_in_memory_for_test().unwrap();
        seed(&catalog);
        let mut req = make_request("/all", "");
        let mut sink = vec![];
        let status = dispatch(&mut req, &catalog, &mut sink).unwrap();
        req.out.flush(&mut sink).unwrap();
        assert_eq!(status, 0);
        let body = String::from_utf8(sink).unwrap();
        assert!(body.contains("=> /app/editors editors\n"));
    }
}
