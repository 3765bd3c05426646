//! Recording mock of the DRM/GBM card
//!
//! Holds a small in-memory model of connectors, encoders and CRTCs, applies
//! modesets to it and records every call in order. Clones share state, so a
//! test keeps one handle while the device owns another.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::c_void;
use std::io;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use anyhow::bail;

use crate::backend::kms::card::{Card, NativeWindow, ScanoutSurface};
use crate::backend::kms::types::{
    BufferId, CardEvent, ConnectorId, ConnectorInfo, ConnectorKind, ConnectorState, CrtcId,
    CrtcState, EncoderId, EncoderInfo, FramebufferId, ModeInfo, ModeTypeFlags, PropertyId,
    Resources, Subpixel,
};

/// Buffers per mock swap chain, like a triple-buffered GBM surface.
pub const SWAP_CHAIN_LEN: usize = 3;

/// One recorded kernel or buffer-manager call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    SetCrtc {
        crtc: CrtcId,
        framebuffer: Option<FramebufferId>,
        connectors: Vec<ConnectorId>,
        mode: Option<ModeInfo>,
    },
    AddFramebuffer {
        buffer: BufferId,
        framebuffer: FramebufferId,
    },
    RemoveFramebuffer(FramebufferId),
    PageFlip {
        crtc: CrtcId,
        framebuffer: FramebufferId,
    },
    WaitReadable,
    ReceiveEvents,
    SetProperty {
        connector: ConnectorId,
        property: PropertyId,
        value: u64,
    },
    CreateSurface {
        width: u32,
        height: u32,
    },
    LockFrontBuffer(BufferId),
    ReleaseBuffer(BufferId),
    CreateCursorBuffer {
        width: u32,
        height: u32,
    },
    WriteCursorBuffer {
        len: usize,
    },
    SetCursor {
        crtc: CrtcId,
        visible: bool,
        hotspot: (i32, i32),
    },
    SetCursorWithoutHotspot {
        crtc: CrtcId,
        visible: bool,
    },
    MoveCursor {
        crtc: CrtcId,
        position: (i32, i32),
    },
}

#[derive(Default)]
struct MockState {
    next_id: u32,
    connectors: Vec<ConnectorInfo>,
    encoders: Vec<EncoderInfo>,
    crtcs: Vec<CrtcState>,
    properties: HashMap<(ConnectorId, String), PropertyId>,
    property_values: HashMap<(ConnectorId, PropertyId), u64>,
    framebuffers: HashSet<FramebufferId>,
    locked: HashSet<BufferId>,
    events: VecDeque<CardEvent>,
    calls: Vec<Call>,
    cursor_plane_size: Option<(u32, u32)>,
    cursor_upload: Option<Vec<u8>>,
    frame: u32,
    fail_page_flip: bool,
    fail_lock: bool,
    fail_add_framebuffer: bool,
    reject_cursor_hotspot: bool,
    auto_complete_flips: bool,
}

impl MockState {
    fn alloc(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn record(&mut self, call: Call) {
        self.calls.push(call);
    }
}

fn not_found(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no such {what}"))
}

#[derive(Clone, Default)]
pub struct MockCard {
    state: Rc<RefCell<MockState>>,
}

impl MockCard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_crtc(&self) -> CrtcId {
        let mut state = self.state.borrow_mut();
        let id = CrtcId(state.alloc());
        state.crtcs.push(CrtcState {
            id,
            position: (0, 0),
            framebuffer: None,
            mode: None,
        });
        id
    }

    /// Add a connector with one encoder that can drive the CRTCs in
    /// `possible_crtcs` (bit `i` is the `i`-th added CRTC).
    pub fn add_connector(
        &self,
        kind: ConnectorKind,
        kind_index: u32,
        state: ConnectorState,
        possible_crtcs: u32,
    ) -> ConnectorId {
        let mut s = self.state.borrow_mut();
        let encoder = EncoderId(s.alloc());
        s.encoders.push(EncoderInfo {
            id: encoder,
            crtc: None,
            possible_crtcs,
        });

        let id = ConnectorId(s.alloc());
        s.connectors.push(ConnectorInfo {
            id,
            kind,
            kind_index,
            state,
            physical_size_mm: (0, 0),
            subpixel: Subpixel::Unknown,
            modes: Vec::new(),
            encoders: vec![encoder],
            current_encoder: None,
        });
        id
    }

    pub fn add_mode(&self, connector: ConnectorId, mode: ModeInfo) {
        self.with_connector(connector, |c| c.modes.push(mode));
    }

    pub fn set_physical_size(&self, connector: ConnectorId, size_mm: (u32, u32)) {
        self.with_connector(connector, |c| c.physical_size_mm = size_mm);
    }

    pub fn set_subpixel(&self, connector: ConnectorId, subpixel: Subpixel) {
        self.with_connector(connector, |c| c.subpixel = subpixel);
    }

    /// Route `connector` through its encoder to `crtc`, as left behind by the
    /// console. With a mode the CRTC also gets a (foreign) framebuffer.
    pub fn route(&self, connector: ConnectorId, crtc: CrtcId, mode: Option<ModeInfo>) {
        let mut s = self.state.borrow_mut();
        let framebuffer = mode.as_ref().map(|_| FramebufferId(s.alloc()));

        let Some(conn) = s.connectors.iter_mut().find(|c| c.id == connector) else {
            panic!("unknown connector {connector:?}");
        };
        let encoder = conn.encoders[0];
        conn.current_encoder = Some(encoder);

        if let Some(enc) = s.encoders.iter_mut().find(|e| e.id == encoder) {
            enc.crtc = Some(crtc);
        }
        if let Some(state) = s.crtcs.iter_mut().find(|c| c.id == crtc) {
            state.mode = mode;
            state.framebuffer = framebuffer;
        }
    }

    pub fn add_dpms(&self, connector: ConnectorId) -> PropertyId {
        let mut s = self.state.borrow_mut();
        let id = PropertyId(s.alloc());
        s.properties.insert((connector, "DPMS".to_owned()), id);
        id
    }

    pub fn set_cursor_plane_size(&self, size: Option<(u32, u32)>) {
        self.state.borrow_mut().cursor_plane_size = size;
    }

    pub fn set_fail_page_flip(&self, fail: bool) {
        self.state.borrow_mut().fail_page_flip = fail;
    }

    pub fn set_fail_lock(&self, fail: bool) {
        self.state.borrow_mut().fail_lock = fail;
    }

    pub fn set_fail_add_framebuffer(&self, fail: bool) {
        self.state.borrow_mut().fail_add_framebuffer = fail;
    }

    /// Fail the hotspot cursor call like a driver without SET_CURSOR2.
    pub fn set_reject_cursor_hotspot(&self, reject: bool) {
        self.state.borrow_mut().reject_cursor_hotspot = reject;
    }

    /// Queue a completion event for every successful page flip.
    pub fn set_auto_complete_flips(&self, auto: bool) {
        self.state.borrow_mut().auto_complete_flips = auto;
    }

    pub fn push_event(&self, event: CardEvent) {
        self.state.borrow_mut().events.push_back(event);
    }

    /// Queue the completion of a flip on `crtc`.
    pub fn complete_flip(&self, crtc: CrtcId) {
        let mut s = self.state.borrow_mut();
        s.frame += 1;
        let frame = s.frame;
        s.events.push_back(CardEvent::PageFlip {
            crtc,
            frame,
            time: Duration::from_millis(16 * frame as u64),
        });
    }

    pub fn pending_events(&self) -> usize {
        self.state.borrow().events.len()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    pub fn count_calls(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.state.borrow().calls.iter().filter(|c| predicate(c)).count()
    }

    pub fn resources_now(&self) -> Resources {
        let s = self.state.borrow();
        Resources {
            connectors: s.connectors.iter().map(|c| c.id).collect(),
            crtcs: s.crtcs.iter().map(|c| c.id).collect(),
        }
    }

    pub fn connector_now(&self, id: ConnectorId) -> ConnectorInfo {
        let s = self.state.borrow();
        match s.connectors.iter().find(|c| c.id == id) {
            Some(connector) => connector.clone(),
            None => panic!("unknown connector {id:?}"),
        }
    }

    pub fn crtc_now(&self, id: CrtcId) -> CrtcState {
        let s = self.state.borrow();
        match s.crtcs.iter().find(|c| c.id == id) {
            Some(crtc) => crtc.clone(),
            None => panic!("unknown crtc {id:?}"),
        }
    }

    pub fn property_value(&self, connector: ConnectorId, property: PropertyId) -> Option<u64> {
        self.state
            .borrow()
            .property_values
            .get(&(connector, property))
            .copied()
    }

    /// Framebuffers added and not yet removed.
    pub fn live_framebuffers(&self) -> usize {
        self.state.borrow().framebuffers.len()
    }

    /// Scanout buffers locked and not yet released.
    pub fn locked_buffers(&self) -> usize {
        self.state.borrow().locked.len()
    }

    /// Bytes of the last cursor upload.
    pub fn cursor_upload(&self) -> Option<Vec<u8>> {
        self.state.borrow().cursor_upload.clone()
    }

    fn with_connector(&self, id: ConnectorId, f: impl FnOnce(&mut ConnectorInfo)) {
        let mut s = self.state.borrow_mut();
        match s.connectors.iter_mut().find(|c| c.id == id) {
            Some(connector) => f(connector),
            None => panic!("unknown connector {id:?}"),
        }
    }
}

/// A plausible mode with the given visible size and refresh.
pub fn mode(width: u16, height: u16, refresh: u32) -> ModeInfo {
    let htotal = width + 160;
    let vtotal = height + 45;
    ModeInfo {
        name: format!("{width}x{height}"),
        clock: htotal as u32 * vtotal as u32 * refresh / 1000,
        hdisplay: width,
        hsync_start: width + 48,
        hsync_end: width + 80,
        htotal,
        hskew: 0,
        vdisplay: height,
        vsync_start: height + 3,
        vsync_end: height + 8,
        vtotal,
        vscan: 0,
        vrefresh: refresh,
        flags: Default::default(),
        mode_type: ModeTypeFlags::DRIVER,
    }
}

/// `mode` flagged as the driver's preferred one.
pub fn preferred_mode(width: u16, height: u16, refresh: u32) -> ModeInfo {
    let mut mode = mode(width, height, refresh);
    mode.mode_type |= ModeTypeFlags::PREFERRED;
    mode
}

pub struct MockSurface {
    state: Rc<RefCell<MockState>>,
    id: usize,
    next_slot: Cell<usize>,
}

pub struct MockBuffer {
    state: Rc<RefCell<MockState>>,
    id: BufferId,
}

impl Drop for MockBuffer {
    fn drop(&mut self) {
        let mut s = self.state.borrow_mut();
        s.locked.remove(&self.id);
        s.record(Call::ReleaseBuffer(self.id));
    }
}

impl ScanoutSurface for MockSurface {
    type Buffer = MockBuffer;

    fn lock_front_buffer(&self) -> io::Result<MockBuffer> {
        let mut s = self.state.borrow_mut();
        if s.fail_lock {
            return Err(io::Error::other("lock failed"));
        }

        let start = self.next_slot.get();
        for offset in 0..SWAP_CHAIN_LEN {
            let slot = (start + offset) % SWAP_CHAIN_LEN;
            let id = BufferId(self.id * 16 + slot);
            if s.locked.insert(id) {
                self.next_slot.set(slot + 1);
                s.record(Call::LockFrontBuffer(id));
                return Ok(MockBuffer {
                    state: self.state.clone(),
                    id,
                });
            }
        }

        Err(io::Error::new(io::ErrorKind::WouldBlock, "no free buffer"))
    }

    fn buffer_id(buffer: &MockBuffer) -> BufferId {
        buffer.id
    }

    fn native_window(&self) -> NativeWindow {
        NativeWindow((self.id << 12) as *mut c_void)
    }
}

pub struct MockCursorBuffer {
    size: (u32, u32),
}

impl Card for MockCard {
    type Surface = MockSurface;
    type CursorBuffer = MockCursorBuffer;

    fn open(path: &Path) -> anyhow::Result<Self> {
        bail!("mock card cannot open {path:?}");
    }

    fn resources(&self) -> io::Result<Resources> {
        Ok(self.resources_now())
    }

    fn connector(&self, id: ConnectorId) -> io::Result<ConnectorInfo> {
        let s = self.state.borrow();
        s.connectors
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| not_found("connector"))
    }

    fn encoder(&self, id: EncoderId) -> io::Result<EncoderInfo> {
        let s = self.state.borrow();
        s.encoders
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| not_found("encoder"))
    }

    fn crtc(&self, id: CrtcId) -> io::Result<CrtcState> {
        let s = self.state.borrow();
        s.crtcs
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| not_found("crtc"))
    }

    fn connector_property(&self, connector: ConnectorId, name: &str) -> Option<PropertyId> {
        let s = self.state.borrow();
        s.properties.get(&(connector, name.to_owned())).copied()
    }

    fn set_connector_property(
        &self,
        connector: ConnectorId,
        property: PropertyId,
        value: u64,
    ) -> io::Result<()> {
        let mut s = self.state.borrow_mut();
        s.record(Call::SetProperty {
            connector,
            property,
            value,
        });
        if !s.properties.values().any(|&p| p == property) {
            return Err(not_found("property"));
        }
        s.property_values.insert((connector, property), value);
        Ok(())
    }

    fn set_crtc(
        &self,
        crtc: CrtcId,
        framebuffer: Option<FramebufferId>,
        position: (u32, u32),
        connectors: &[ConnectorId],
        mode: Option<&ModeInfo>,
    ) -> io::Result<()> {
        let mut s = self.state.borrow_mut();
        s.record(Call::SetCrtc {
            crtc,
            framebuffer,
            connectors: connectors.to_vec(),
            mode: mode.cloned(),
        });

        let state = s
            .crtcs
            .iter_mut()
            .find(|c| c.id == crtc)
            .ok_or_else(|| not_found("crtc"))?;
        state.framebuffer = framebuffer;
        state.position = position;
        state.mode = mode.cloned();
        Ok(())
    }

    fn add_framebuffer(&self, buffer: &MockBuffer) -> io::Result<FramebufferId> {
        let mut s = self.state.borrow_mut();
        if s.fail_add_framebuffer {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "bad buffer"));
        }
        let framebuffer = FramebufferId(s.alloc());
        s.framebuffers.insert(framebuffer);
        s.record(Call::AddFramebuffer {
            buffer: buffer.id,
            framebuffer,
        });
        Ok(framebuffer)
    }

    fn remove_framebuffer(&self, framebuffer: FramebufferId) -> io::Result<()> {
        let mut s = self.state.borrow_mut();
        s.record(Call::RemoveFramebuffer(framebuffer));
        if !s.framebuffers.remove(&framebuffer) {
            return Err(not_found("framebuffer"));
        }
        // Legacy RMFB turns off every CRTC still scanning the framebuffer out.
        for state in s.crtcs.iter_mut().filter(|c| c.framebuffer == Some(framebuffer)) {
            state.framebuffer = None;
            state.mode = None;
        }
        Ok(())
    }

    fn page_flip(&self, crtc: CrtcId, framebuffer: FramebufferId) -> io::Result<()> {
        let auto_complete = {
            let mut s = self.state.borrow_mut();
            s.record(Call::PageFlip { crtc, framebuffer });
            if s.fail_page_flip {
                return Err(io::Error::from_raw_os_error(libc::EBUSY));
            }
            let state = s
                .crtcs
                .iter_mut()
                .find(|c| c.id == crtc)
                .ok_or_else(|| not_found("crtc"))?;
            if state.mode.is_none() {
                return Err(io::Error::from_raw_os_error(libc::EINVAL));
            }
            state.framebuffer = Some(framebuffer);
            s.auto_complete_flips
        };

        if auto_complete {
            self.complete_flip(crtc);
        }
        Ok(())
    }

    fn wait_readable(&self, _timeout: Option<Duration>) -> io::Result<bool> {
        let mut s = self.state.borrow_mut();
        s.record(Call::WaitReadable);
        Ok(!s.events.is_empty())
    }

    fn receive_events(&self) -> io::Result<Vec<CardEvent>> {
        let mut s = self.state.borrow_mut();
        s.record(Call::ReceiveEvents);
        Ok(s.events.drain(..).collect())
    }

    fn cursor_plane_size(&self) -> io::Result<(u32, u32)> {
        self.state
            .borrow()
            .cursor_plane_size
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "no cursor cap"))
    }

    fn create_surface(&self, width: u32, height: u32) -> io::Result<MockSurface> {
        let mut s = self.state.borrow_mut();
        s.record(Call::CreateSurface { width, height });
        let id = s.alloc() as usize;
        Ok(MockSurface {
            state: self.state.clone(),
            id,
            next_slot: Cell::new(0),
        })
    }

    fn create_cursor_buffer(&self, width: u32, height: u32) -> io::Result<MockCursorBuffer> {
        self.state
            .borrow_mut()
            .record(Call::CreateCursorBuffer { width, height });
        Ok(MockCursorBuffer {
            size: (width, height),
        })
    }

    fn write_cursor_buffer(&self, buffer: &mut MockCursorBuffer, pixels: &[u8]) -> io::Result<()> {
        let mut s = self.state.borrow_mut();
        s.record(Call::WriteCursorBuffer { len: pixels.len() });
        let expected = (buffer.size.0 * buffer.size.1 * 4) as usize;
        if pixels.len() != expected {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "wrong size"));
        }
        s.cursor_upload = Some(pixels.to_vec());
        Ok(())
    }

    fn set_cursor(
        &self,
        crtc: CrtcId,
        buffer: Option<&MockCursorBuffer>,
        hotspot: (i32, i32),
    ) -> io::Result<()> {
        let mut s = self.state.borrow_mut();
        s.record(Call::SetCursor {
            crtc,
            visible: buffer.is_some(),
            hotspot,
        });
        if s.reject_cursor_hotspot {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(())
    }

    fn set_cursor_without_hotspot(
        &self,
        crtc: CrtcId,
        buffer: Option<&MockCursorBuffer>,
    ) -> io::Result<()> {
        self.state.borrow_mut().record(Call::SetCursorWithoutHotspot {
            crtc,
            visible: buffer.is_some(),
        });
        Ok(())
    }

    fn move_cursor(&self, crtc: CrtcId, position: (i32, i32)) -> io::Result<()> {
        self.state
            .borrow_mut()
            .record(Call::MoveCursor { crtc, position });
        Ok(())
    }
}
