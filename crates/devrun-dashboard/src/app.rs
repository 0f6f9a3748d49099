use crate::sample::{ResourceSample, Sampler};
use crossterm::event::{Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers, MouseEventKind};
use devrun_supervisor::{apply_event, Project, SupervisorEvent};
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) const PAGE_LINES: usize = 10;
const MOUSE_LINES: usize = 3;
pub(crate) const SPINNER: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    None,
    Quit,
    OpenUrl(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Shutdown,
}

pub struct App {
    pub(crate) title: String,
    pub(crate) projects: Vec<Arc<Project>>,
    pub(crate) selected: usize,
    pub(crate) compact: bool,
    pub(crate) focused: bool,
    /// Lines scrolled up from the newest log line; 0 follows the tail.
    pub(crate) scroll: usize,
    pub(crate) frame: usize,
    pub(crate) samples: HashMap<usize, ResourceSample>,
    pub(crate) temperature: Option<f32>,
    pub(crate) status_note: Option<String>,
    pub(crate) stopping: bool,
}

impl App {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            projects: Vec::new(),
            selected: 0,
            compact: false,
            focused: false,
            scroll: 0,
            frame: 0,
            samples: HashMap::new(),
            temperature: None,
            status_note: None,
            stopping: false,
        }
    }

    pub fn projects(&self) -> &[Arc<Project>] {
        &self.projects
    }

    pub fn selected(&self) -> usize {
        self.selected
    }

    pub fn is_compact(&self) -> bool {
        self.compact
    }

    pub fn is_focused(&self) -> bool {
        self.focused
    }

    pub fn scroll(&self) -> usize {
        self.scroll
    }

    /// Picks up projects registered after the loop started.
    pub fn sync_projects(&mut self, projects: Vec<Arc<Project>>) {
        if projects.len() != self.projects.len() {
            self.projects = projects;
            self.selected = self.selected.min(self.projects.len().saturating_sub(1));
        }
    }

    pub fn selected_project(&self) -> Option<&Arc<Project>> {
        self.projects.get(self.selected)
    }

    pub fn spinner(&self) -> &'static str {
        SPINNER[self.frame % SPINNER.len()]
    }

    pub fn advance_frame(&mut self) {
        self.frame = self.frame.wrapping_add(1);
    }

    pub fn apply(&mut self, event: SupervisorEvent) -> Control {
        match event {
            SupervisorEvent::Shutdown => Control::Shutdown,
            other => {
                apply_event(&self.projects, other);
                Control::Continue
            }
        }
    }

    pub fn sample(&mut self, sampler: &mut Sampler) {
        sampler.refresh();
        for (index, project) in self.projects.iter().enumerate() {
            let sample = project
                .process_handle()
                .and_then(|handle| sampler.sample_tree(handle.pid));
            match sample {
                Some(sample) => {
                    self.samples.insert(index, sample);
                }
                None => {
                    self.samples.remove(&index);
                }
            }
        }
        self.temperature = sampler.temperature();
    }

    fn move_selection(&mut self, delta: isize) {
        if self.projects.is_empty() {
            return;
        }
        let last = self.projects.len() - 1;
        self.selected = self.selected.saturating_add_signed(delta).min(last);
        self.scroll = 0;
    }

    fn scroll_up(&mut self, lines: usize) {
        let max = self
            .selected_project()
            .map(|project| project.log_len().saturating_sub(1))
            .unwrap_or(0);
        self.scroll = self.scroll.saturating_add(lines).min(max);
    }

    fn scroll_down(&mut self, lines: usize) {
        self.scroll = self.scroll.saturating_sub(lines);
    }

    pub fn handle_input(&mut self, event: Event) -> Action {
        match event {
            Event::Key(key) if key.kind == KeyEventKind::Press => self.handle_key(key),
            Event::Mouse(mouse) => {
                match mouse.kind {
                    MouseEventKind::ScrollUp => self.scroll_up(MOUSE_LINES),
                    MouseEventKind::ScrollDown => self.scroll_down(MOUSE_LINES),
                    _ => {}
                }
                Action::None
            }
            _ => Action::None,
        }
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> Action {
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            return Action::Quit;
        }
        match key.code {
            KeyCode::Char('q') => Action::Quit,
            KeyCode::Char('c') => {
                self.compact = !self.compact;
                Action::None
            }
            KeyCode::Enter => {
                if self.selected_project().is_some() {
                    self.focused = true;
                    self.scroll = 0;
                }
                Action::None
            }
            KeyCode::Esc => {
                self.focused = false;
                self.scroll = 0;
                Action::None
            }
            KeyCode::Down | KeyCode::Char('j') => {
                if self.focused {
                    self.scroll_down(1);
                } else {
                    self.move_selection(1);
                }
                Action::None
            }
            KeyCode::Up | KeyCode::Char('k') => {
                if self.focused {
                    self.scroll_up(1);
                } else {
                    self.move_selection(-1);
                }
                Action::None
            }
            KeyCode::PageUp => {
                self.scroll_up(PAGE_LINES);
                Action::None
            }
            KeyCode::PageDown => {
                self.scroll_down(PAGE_LINES);
                Action::None
            }
            KeyCode::Char('o') => match self.selected_project().and_then(|project| project.url()) {
                Some(url) => {
                    self.status_note = Some(format!("opening {url}"));
                    Action::OpenUrl(url)
                }
                None => {
                    self.status_note = Some("no URL detected yet".to_string());
                    Action::None
                }
            },
            _ => Action::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devrun_core::{Phase, Status};

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn app_with(names: &[&str]) -> App {
        let mut app = App::new("devrun");
        app.sync_projects(
            names
                .iter()
                .map(|name| Arc::new(Project::new(*name, format!("/tmp/{name}"))))
                .collect(),
        );
        app
    }

    #[test]
    fn navigation_stays_in_bounds() {
        let mut app = app_with(&["api", "web"]);
        app.handle_key(key(KeyCode::Up));
        assert_eq!(app.selected(), 0);
        app.handle_key(key(KeyCode::Char('j')));
        app.handle_key(key(KeyCode::Down));
        assert_eq!(app.selected(), 1);
        app.handle_key(key(KeyCode::Char('k')));
        assert_eq!(app.selected(), 0);
    }

    #[test]
    fn compact_toggles_and_focus_round_trips() {
        let mut app = app_with(&["web"]);
        assert!(!app.is_compact());
        app.handle_key(key(KeyCode::Char('c')));
        assert!(app.is_compact());
        app.handle_key(key(KeyCode::Char('c')));
        assert!(!app.is_compact());

        app.handle_key(key(KeyCode::Enter));
        assert!(app.is_focused());
        app.handle_key(key(KeyCode::Esc));
        assert!(!app.is_focused());
    }

    #[test]
    fn quit_keys() {
        let mut app = app_with(&["web"]);
        assert_eq!(app.handle_key(key(KeyCode::Char('q'))), Action::Quit);
        let ctrl_c = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL);
        assert_eq!(app.handle_key(ctrl_c), Action::Quit);
        assert!(!app.is_compact());
    }

    #[test]
    fn scrolling_is_clamped_to_log_length() {
        let mut app = app_with(&["web"]);
        for n in 0..5 {
            app.projects[0].append_log(format!("line {n}"));
        }
        app.handle_key(key(KeyCode::PageUp));
        assert_eq!(app.scroll(), 4);
        app.handle_key(key(KeyCode::PageDown));
        assert_eq!(app.scroll(), 0);
    }

    #[test]
    fn open_requires_a_detected_url() {
        let mut app = app_with(&["web"]);
        assert_eq!(app.handle_key(key(KeyCode::Char('o'))), Action::None);
        app.projects[0].append_log("[10:00:00]   Local:   http://localhost:5173/");
        assert_eq!(
            app.handle_key(key(KeyCode::Char('o'))),
            Action::OpenUrl("http://localhost:5173".to_string())
        );
    }

    #[test]
    fn mailbox_events_update_projects_until_shutdown() {
        let mut app = app_with(&["web"]);
        let control = app.apply(SupervisorEvent::Update {
            index: 0,
            phase: Phase::Build,
            status: Status::Pending,
        });
        assert_eq!(control, Control::Continue);
        assert_eq!(app.projects[0].phase(), Phase::Build);
        app.apply(SupervisorEvent::Log {
            index: 7,
            line: "ignored".into(),
        });
        assert_eq!(app.projects[0].log_len(), 0);
        assert_eq!(app.apply(SupervisorEvent::Shutdown), Control::Shutdown);
    }
}
