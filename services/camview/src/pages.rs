//! HTML for the published site.
//!
//! Pages only use relative links so the same output works from a local web
//! root or an object-store bucket.

use crate::camera::Camera;
use crate::clock;
use crate::pipeline::{capture_time_of_day, Artifact};
use chrono::NaiveDate;
use std::fmt::Write;

pub const INDEX_PAGE: &str = "index.html";
pub const HIDDEN_INDEX_PAGE: &str = "index_hidden.html";

/// Escape text for HTML element content and quoted attributes.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n</head>\n<body>\n{}</body>\n</html>\n",
        escape(title),
        body
    )
}

fn caption(filename: &str) -> String {
    match capture_time_of_day(filename) {
        Some(t) => t.format("%H:%M:%S").to_string(),
        None => filename.to_string(),
    }
}

/// Per-image page, published as `<date>/<camera>/html/<stem>.html`.
pub fn detail_page(camera: &Camera, date: NaiveDate, filename: &str) -> String {
    let title = format!(
        "{} {} {}",
        camera.longname,
        clock::format_date(date),
        caption(filename)
    );
    let hires = escape(&Artifact::Hires.file_name(filename));
    let medium = escape(&Artifact::Medium.file_name(filename));

    let mut body = String::new();
    let _ = writeln!(body, "<h1>{}</h1>", escape(&title));
    let _ = writeln!(
        body,
        "<p><a href=\"../{}\">All images</a></p>",
        INDEX_PAGE
    );
    let _ = writeln!(
        body,
        "<a href=\"../{}/{}\"><img src=\"../{}/{}\" alt=\"{}\"></a>",
        Artifact::Hires.dir(),
        hires,
        Artifact::Medium.dir(),
        medium,
        escape(filename)
    );
    page(&title, &body)
}

/// Thumbnail grid for one camera and date, newest first.
pub fn listing_page(camera: &Camera, date: NaiveDate, images: &[String]) -> String {
    let title = format!("{} {}", camera.longname, clock::format_date(date));

    let mut body = String::new();
    let _ = writeln!(body, "<h1>{}</h1>", escape(&title));
    let _ = writeln!(body, "<p>{} images</p>", images.len());
    let _ = writeln!(body, "<div class=\"thumbnails\">");
    for filename in images.iter().rev() {
        let _ = writeln!(
            body,
            "<a href=\"{}/{}\"><img src=\"{}/{}\" alt=\"{}\" title=\"{}\"></a>",
            Artifact::Html.dir(),
            escape(&Artifact::Html.file_name(filename)),
            Artifact::Thumbnail.dir(),
            escape(&Artifact::Thumbnail.file_name(filename)),
            escape(filename),
            escape(&caption(filename))
        );
    }
    let _ = writeln!(body, "</div>");
    page(&title, &body)
}

/// Unlinked operator view: plain list of full-resolution files.
pub fn hidden_listing_page(camera: &Camera, date: NaiveDate, images: &[String]) -> String {
    let title = format!("{} {} (full resolution)", camera.longname, clock::format_date(date));

    let mut body = String::new();
    let _ = writeln!(body, "<h1>{}</h1>", escape(&title));
    let _ = writeln!(body, "<ul>");
    for filename in images {
        let _ = writeln!(
            body,
            "<li><a href=\"{}/{}\">{}</a></li>",
            Artifact::Hires.dir(),
            escape(&Artifact::Hires.file_name(filename)),
            escape(filename)
        );
    }
    let _ = writeln!(body, "</ul>");
    page(&title, &body)
}

/// Site root: every retained date with links to its camera pages, newest first.
pub fn root_index(site_name: &str, dates: &[(NaiveDate, Vec<Camera>)]) -> String {
    let mut body = String::new();
    let _ = writeln!(body, "<h1>{}</h1>", escape(site_name));
    for (date, cameras) in dates.iter().rev() {
        let date_name = clock::format_date(*date);
        let _ = writeln!(body, "<h2>{}</h2>", date_name);
        let _ = writeln!(body, "<ul>");
        for camera in cameras {
            let _ = writeln!(
                body,
                "<li><a href=\"{}/{}/{}\">{}</a></li>",
                date_name,
                escape(&camera.shortname),
                INDEX_PAGE,
                escape(&camera.longname)
            );
        }
        let _ = writeln!(body, "</ul>");
    }
    page(site_name, &body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2013, 7, 1).unwrap()
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("<a href=\"x\">&'"), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;");
    }

    #[test]
    fn test_detail_page_links() {
        let camera = Camera::new("camera1", "Front Gate");
        let html = detail_page(&camera, date(), "12-00-01-00001.jpg");
        assert!(html.contains("Front Gate 2013-07-01 12:00:01"));
        assert!(html.contains("../hires/12-00-01-00001.jpg"));
        assert!(html.contains("../mediumres/12-00-01-00001_medium.jpg"));
        assert!(html.contains("../index.html"));
    }

    #[test]
    fn test_listing_newest_first() {
        let camera = Camera::new("camera1", "Front Gate");
        let images = vec!["10-00-00-00001.jpg".to_string(), "11-00-00-00001.jpg".to_string()];
        let html = listing_page(&camera, date(), &images);

        let newer = html.find("thumbnails/11-00-00-00001_thumb.jpg").unwrap();
        let older = html.find("thumbnails/10-00-00-00001_thumb.jpg").unwrap();
        assert!(newer < older);
        assert!(html.contains("html/11-00-00-00001.html"));
        assert!(html.contains("<p>2 images</p>"));
    }

    #[test]
    fn test_hidden_listing_links_hires() {
        let camera = Camera::new("camera1", "Front Gate");
        let images = vec!["10-00-00-00001.jpg".to_string()];
        let html = hidden_listing_page(&camera, date(), &images);
        assert!(html.contains("hires/10-00-00-00001.jpg"));
    }

    #[test]
    fn test_root_index() {
        let dates = vec![(date(), vec![Camera::new("camera1", "Front <Gate>")])];
        let html = root_index("camview", &dates);
        assert!(html.contains("2013-07-01/camera1/index.html"));
        assert!(html.contains("Front &lt;Gate&gt;"));
    }
}
