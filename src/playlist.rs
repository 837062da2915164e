//! LL-HLS playlist state: an ordered list of segments, each carrying its
//! partial segments, rendered to and recovered from `index.m3u8`.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::storage;

#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    pub uri: String,
    pub duration: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Segment {
    pub seq: u64,
    pub uri: String,
    pub duration: f64,
    pub parts: Vec<Part>,
    pub discontinuity: bool,
    pub complete: bool,
    pub creation_time_ms: i64,
}

#[derive(Debug, Clone)]
pub struct PlaylistConfig {
    pub target_duration: Duration,
    pub part_duration: Duration,
    pub hold_back: Duration,
    pub part_hold_back: Duration,
    pub keep_segments: usize,
    pub enable_partial: bool,
    pub init_filename: String,
    pub playlist_name: String,
}

pub struct PlaylistManager {
    cfg: PlaylistConfig,
    dir: PathBuf,
    segments: Vec<Segment>,
    pending_discontinuity: bool,
}

impl PlaylistManager {
    pub fn new(cfg: PlaylistConfig, dir: PathBuf) -> Self {
        Self {
            cfg,
            dir,
            segments: Vec::new(),
            pending_discontinuity: false,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Arm a discontinuity marker for the next segment created.
    pub fn mark_discontinuity_next(&mut self) {
        self.pending_discontinuity = true;
    }

    pub fn add_part(&mut self, seg_seq: u64, part_uri: &str, duration: f64) {
        let seg = self.ensure_segment(seg_seq);
        seg.parts.push(Part {
            uri: part_uri.to_string(),
            duration,
        });
    }

    pub fn finalize_segment(&mut self, seg_seq: u64, seg_uri: &str, duration: f64) {
        let seg = self.ensure_segment(seg_seq);
        seg.uri = seg_uri.to_string();
        seg.duration = duration;
        seg.complete = true;
    }

    fn ensure_segment(&mut self, seg_seq: u64) -> &mut Segment {
        if let Some(idx) = self.segments.iter().position(|s| s.seq == seg_seq) {
            return &mut self.segments[idx];
        }
        let mut seg = Segment {
            seq: seg_seq,
            creation_time_ms: chrono::Utc::now().timestamp_millis(),
            ..Segment::default()
        };
        if self.pending_discontinuity {
            seg.discontinuity = true;
            self.pending_discontinuity = false;
        }
        self.segments.push(seg);
        self.segments.last_mut().expect("just pushed")
    }

    /// Drop the oldest segments beyond the window. The removed segments are
    /// returned so the caller can delete their files.
    pub fn prune(&mut self) -> Vec<Segment> {
        if self.cfg.keep_segments == 0 || self.segments.len() <= self.cfg.keep_segments {
            return Vec::new();
        }
        let remove_count = self.segments.len() - self.cfg.keep_segments;
        self.segments.drain(..remove_count).collect()
    }

    /// Delete the files of pruned segments (segment plus any parts).
    pub fn remove_files(&self, segments: &[Segment]) {
        for seg in segments {
            if !seg.uri.is_empty() {
                let _ = storage::remove_file(&self.dir.join(&seg.uri));
            }
            for part in &seg.parts {
                let _ = storage::remove_file(&self.dir.join(&part.uri));
            }
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("#EXTM3U\n");
        out.push_str("#EXT-X-VERSION:9\n");
        out.push_str(&format!(
            "#EXT-X-TARGETDURATION:{}\n",
            self.cfg.target_duration.as_secs_f64().ceil() as u64
        ));
        out.push_str(&format!(
            "#EXT-X-SERVER-CONTROL:CAN-BLOCK-RELOAD=YES,HOLD-BACK={:.3},PART-HOLD-BACK={:.3}\n",
            self.cfg.hold_back.as_secs_f64(),
            self.cfg.part_hold_back.as_secs_f64()
        ));
        if self.cfg.enable_partial {
            out.push_str(&format!(
                "#EXT-X-PART-INF:PART-TARGET={:.3}\n",
                self.cfg.part_duration.as_secs_f64()
            ));
        }
        out.push_str(&format!("#EXT-X-MAP:URI=\"{}\"\n", self.cfg.init_filename));
        let media_seq = self.segments.first().map(|s| s.seq).unwrap_or(0);
        out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{}\n", media_seq));

        for seg in &self.segments {
            if seg.discontinuity {
                out.push_str("#EXT-X-DISCONTINUITY\n");
            }
            if self.cfg.enable_partial {
                for part in &seg.parts {
                    out.push_str(&format!(
                        "#EXT-X-PART:DURATION={:.3},URI=\"{}\"\n",
                        part.duration, part.uri
                    ));
                }
            }
            if seg.complete {
                out.push_str(&format!("#EXTINF:{:.3},\n{}\n", seg.duration, seg.uri));
            }
        }
        out
    }

    pub fn write(&self) -> io::Result<()> {
        self.write_to(&self.dir.clone())
    }

    pub fn write_to(&self, dir: &Path) -> io::Result<()> {
        let path = dir.join(&self.cfg.playlist_name);
        storage::write_file_atomic(&path, self.render().as_bytes())
    }

    /// Recover state from an on-disk playlist. Returns the last sequence
    /// number and whether any segments were found; a missing file is fine.
    pub fn load_from_file(&mut self, path: &Path, drop_incomplete: bool) -> io::Result<(u64, bool)> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok((0, false)),
            Err(err) => return Err(err),
        };
        let segments = parse_playlist(&content, drop_incomplete)?;
        let last_seq = segments.last().map(|s| s.seq).unwrap_or(0);
        let has_segments = !segments.is_empty();
        self.segments = segments;
        Ok((last_seq, has_segments))
    }
}

fn parse_playlist(content: &str, drop_incomplete: bool) -> io::Result<Vec<Segment>> {
    let mut segments: Vec<Segment> = Vec::new();
    let mut pending_discontinuity = false;
    let mut current_idx: Option<usize> = None;
    let mut has_media_seq = false;
    let mut next_seq = 0u64;
    let mut expect_uri = false;
    let mut pending_duration = 0.0f64;
    let now_ms = chrono::Utc::now().timestamp_millis();

    let create_segment =
        |segments: &mut Vec<Segment>, next_seq: &mut u64, pending_discontinuity: &mut bool| {
            let mut seg = Segment {
                seq: *next_seq,
                creation_time_ms: now_ms,
                ..Segment::default()
            };
            *next_seq += 1;
            if *pending_discontinuity {
                seg.discontinuity = true;
                *pending_discontinuity = false;
            }
            segments.push(seg);
            segments.len() - 1
        };

    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if expect_uri {
            if line.starts_with('#') {
                continue;
            }
            let idx = match current_idx {
                Some(idx) if !segments[idx].complete => idx,
                _ => create_segment(&mut segments, &mut next_seq, &mut pending_discontinuity),
            };
            segments[idx].uri = line.to_string();
            segments[idx].duration = pending_duration;
            segments[idx].complete = true;
            current_idx = Some(idx);
            expect_uri = false;
            continue;
        }
        if let Some(value) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            let seq = value
                .trim()
                .parse::<u64>()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            has_media_seq = true;
            next_seq = seq;
            continue;
        }
        if line == "#EXT-X-DISCONTINUITY" {
            pending_discontinuity = true;
            continue;
        }
        if let Some(attrs) = line.strip_prefix("#EXT-X-PART:") {
            let Some(part) = parse_part_line(attrs) else {
                continue;
            };
            let idx = match current_idx {
                Some(idx) if !segments[idx].complete => idx,
                _ => create_segment(&mut segments, &mut next_seq, &mut pending_discontinuity),
            };
            segments[idx].parts.push(part);
            current_idx = Some(idx);
            continue;
        }
        if let Some(value) = line.strip_prefix("#EXTINF:") {
            let value = value.split(',').next().unwrap_or(value).trim();
            pending_duration = value
                .parse::<f64>()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            expect_uri = true;
            continue;
        }
    }

    if drop_incomplete {
        if let Some(last) = segments.last() {
            if !last.complete {
                segments.pop();
            }
        }
    }

    if !has_media_seq && !segments.is_empty() {
        for (i, seg) in segments.iter_mut().enumerate() {
            seg.seq = i as u64;
        }
    }

    Ok(segments)
}

fn parse_part_line(attrs: &str) -> Option<Part> {
    let mut part = Part {
        uri: String::new(),
        duration: 0.0,
    };
    for field in attrs.split(',') {
        let mut kv = field.trim().splitn(2, '=');
        let key = kv.next()?;
        let Some(value) = kv.next() else {
            continue;
        };
        let value = value.trim_matches('"');
        match key {
            "DURATION" => {
                if let Ok(dur) = value.parse::<f64>() {
                    part.duration = dur;
                }
            }
            "URI" => part.uri = value.to_string(),
            _ => {}
        }
    }
    if part.uri.is_empty() {
        return None;
    }
    Some(part)
}
