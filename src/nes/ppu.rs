use tracing::trace;

use super::cartridge::Cartridge;
use super::mapper::Mirroring;
use super::palette::NES_PALETTE;

pub const FRAME_WIDTH: usize = 256;
pub const FRAME_HEIGHT: usize = 240;
pub const PATTERN_TABLE_SIZE: usize = 128;

pub const DOTS_PER_SCANLINE: u32 = 341;
pub const SCANLINES_PER_FRAME: u32 = 262;

/// $2000 PPUCTRL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PpuCtrl(pub u8);

impl PpuCtrl {
    pub fn nametable_x(self) -> bool {
        self.0 & 0x01 != 0
    }

    pub fn nametable_y(self) -> bool {
        self.0 & 0x02 != 0
    }

    pub fn increment_32(self) -> bool {
        self.0 & 0x04 != 0
    }

    pub fn sprite_table(self) -> u16 {
        if self.0 & 0x08 != 0 { 0x1000 } else { 0x0000 }
    }

    pub fn background_table(self) -> u16 {
        if self.0 & 0x10 != 0 { 0x1000 } else { 0x0000 }
    }

    pub fn sprite_size_16(self) -> bool {
        self.0 & 0x20 != 0
    }

    pub fn nmi_enabled(self) -> bool {
        self.0 & 0x80 != 0
    }
}

/// $2001 PPUMASK.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PpuMask(pub u8);

impl PpuMask {
    pub fn grayscale(self) -> bool {
        self.0 & 0x01 != 0
    }

    pub fn show_background_left(self) -> bool {
        self.0 & 0x02 != 0
    }

    pub fn show_sprites_left(self) -> bool {
        self.0 & 0x04 != 0
    }

    pub fn show_background(self) -> bool {
        self.0 & 0x08 != 0
    }

    pub fn show_sprites(self) -> bool {
        self.0 & 0x10 != 0
    }

    /// Colour emphasis bits (R, G, B). Stored only.
    pub fn emphasis(self) -> u8 {
        self.0 >> 5
    }

    pub fn rendering_enabled(self) -> bool {
        self.show_background() || self.show_sprites()
    }
}

/// $2002 PPUSTATUS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PpuStatus(pub u8);

impl PpuStatus {
    const SPRITE_OVERFLOW: u8 = 0x20;
    const SPRITE_ZERO_HIT: u8 = 0x40;
    const VBLANK: u8 = 0x80;

    pub fn sprite_overflow(self) -> bool {
        self.0 & Self::SPRITE_OVERFLOW != 0
    }

    pub fn sprite_zero_hit(self) -> bool {
        self.0 & Self::SPRITE_ZERO_HIT != 0
    }

    pub fn vblank(self) -> bool {
        self.0 & Self::VBLANK != 0
    }

    pub fn set_sprite_overflow(&mut self, value: bool) {
        self.set(Self::SPRITE_OVERFLOW, value);
    }

    pub fn set_sprite_zero_hit(&mut self, value: bool) {
        self.set(Self::SPRITE_ZERO_HIT, value);
    }

    pub fn set_vblank(&mut self, value: bool) {
        self.set(Self::VBLANK, value);
    }

    fn set(&mut self, bit: u8, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

/// Packed scroll/VRAM address: `yyy NN YYYYY XXXXX`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Loopy(pub u16);

impl Loopy {
    pub fn coarse_x(self) -> u16 {
        self.0 & 0x001F
    }

    pub fn coarse_y(self) -> u16 {
        (self.0 >> 5) & 0x001F
    }

    pub fn nametable_x(self) -> u16 {
        (self.0 >> 10) & 0x01
    }

    pub fn nametable_y(self) -> u16 {
        (self.0 >> 11) & 0x01
    }

    pub fn fine_y(self) -> u16 {
        (self.0 >> 12) & 0x07
    }

    pub fn set_coarse_x(&mut self, value: u16) {
        self.0 = (self.0 & !0x001F) | (value & 0x1F);
    }

    pub fn set_coarse_y(&mut self, value: u16) {
        self.0 = (self.0 & !0x03E0) | ((value & 0x1F) << 5);
    }

    pub fn set_nametable_x(&mut self, value: u16) {
        self.0 = (self.0 & !0x0400) | ((value & 0x01) << 10);
    }

    pub fn set_nametable_y(&mut self, value: u16) {
        self.0 = (self.0 & !0x0800) | ((value & 0x01) << 11);
    }

    pub fn set_fine_y(&mut self, value: u16) {
        self.0 = (self.0 & !0x7000) | ((value & 0x07) << 12);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SpriteEntry {
    y: u8,
    tile: u8,
    attributes: u8,
    x: u8,
}

impl SpriteEntry {
    const EMPTY: Self = Self {
        y: 0xFF,
        tile: 0xFF,
        attributes: 0xFF,
        x: 0xFF,
    };

    fn from_oam(oam: &[u8; 256], index: usize) -> Self {
        let base = index * 4;
        Self {
            y: oam[base],
            tile: oam[base + 1],
            attributes: oam[base + 2],
            x: oam[base + 3],
        }
    }
}

pub struct Ppu {
    ctrl: PpuCtrl,
    mask: PpuMask,
    status: PpuStatus,

    oam_addr: u8,
    oam: [u8; 256],

    nametables: [[u8; 1024]; 2],
    palette_ram: [u8; 32],
    pattern_fallback: [[u8; 4096]; 2],

    write_toggle: bool,
    vram_addr: Loopy,
    tram_addr: Loopy,
    fine_x: u8,
    data_buffer: u8,

    scanline: i16,
    cycle: i16,
    frame_complete: bool,
    nmi: bool,

    next_tile_id: u8,
    next_tile_attr: u8,
    next_tile_lsb: u8,
    next_tile_msb: u8,
    bg_shift_pattern_lo: u16,
    bg_shift_pattern_hi: u16,
    bg_shift_attr_lo: u16,
    bg_shift_attr_hi: u16,

    sprite_scanline: [SpriteEntry; 8],
    sprite_count: usize,
    sprite_patterns_lo: [u8; 8],
    sprite_patterns_hi: [u8; 8],
    sprite_zero_hit_possible: bool,
    sprite_zero_being_rendered: bool,

    frame_indices: Vec<u8>,
    frame_buffer: Vec<u8>,
    frame_count: u64,
}

impl Default for Ppu {
    fn default() -> Self {
        Self::new()
    }
}

impl Ppu {
    pub fn new() -> Self {
        Self {
            ctrl: PpuCtrl::default(),
            mask: PpuMask::default(),
            status: PpuStatus::default(),
            oam_addr: 0,
            oam: [0; 256],
            nametables: [[0; 1024]; 2],
            palette_ram: [0; 32],
            pattern_fallback: [[0; 4096]; 2],
            write_toggle: false,
            vram_addr: Loopy::default(),
            tram_addr: Loopy::default(),
            fine_x: 0,
            data_buffer: 0,
            scanline: 0,
            cycle: 0,
            frame_complete: false,
            nmi: false,
            next_tile_id: 0,
            next_tile_attr: 0,
            next_tile_lsb: 0,
            next_tile_msb: 0,
            bg_shift_pattern_lo: 0,
            bg_shift_pattern_hi: 0,
            bg_shift_attr_lo: 0,
            bg_shift_attr_hi: 0,
            sprite_scanline: [SpriteEntry::EMPTY; 8],
            sprite_count: 0,
            sprite_patterns_lo: [0; 8],
            sprite_patterns_hi: [0; 8],
            sprite_zero_hit_possible: false,
            sprite_zero_being_rendered: false,
            frame_indices: vec![0; FRAME_WIDTH * FRAME_HEIGHT],
            frame_buffer: vec![0; FRAME_WIDTH * FRAME_HEIGHT * 4],
            frame_count: 0,
        }
    }

    /// Clears registers, scroll state and the pixel pipeline. Memory
    /// (nametables, palette, OAM) survives like on hardware.
    pub fn reset(&mut self) {
        self.ctrl = PpuCtrl::default();
        self.mask = PpuMask::default();
        self.status = PpuStatus::default();
        self.oam_addr = 0;
        self.write_toggle = false;
        self.vram_addr = Loopy::default();
        self.tram_addr = Loopy::default();
        self.fine_x = 0;
        self.data_buffer = 0;
        self.scanline = 0;
        self.cycle = 0;
        self.frame_complete = false;
        self.nmi = false;
        self.next_tile_id = 0;
        self.next_tile_attr = 0;
        self.next_tile_lsb = 0;
        self.next_tile_msb = 0;
        self.bg_shift_pattern_lo = 0;
        self.bg_shift_pattern_hi = 0;
        self.bg_shift_attr_lo = 0;
        self.bg_shift_attr_hi = 0;
        self.sprite_scanline = [SpriteEntry::EMPTY; 8];
        self.sprite_count = 0;
        self.sprite_patterns_lo = [0; 8];
        self.sprite_patterns_hi = [0; 8];
        self.sprite_zero_hit_possible = false;
        self.sprite_zero_being_rendered = false;
        self.frame_count = 0;
    }

    /// 256x240 RGBA8.
    pub fn frame_buffer(&self) -> &[u8] {
        &self.frame_buffer
    }

    /// 256x240 system palette indices (0..=63).
    pub fn frame_indices(&self) -> &[u8] {
        &self.frame_indices
    }

    pub fn frame_complete(&self) -> bool {
        self.frame_complete
    }

    pub fn clear_frame_complete(&mut self) {
        self.frame_complete = false;
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn take_nmi(&mut self) -> bool {
        let pending = self.nmi;
        self.nmi = false;
        pending
    }

    pub fn debug_ctrl(&self) -> PpuCtrl {
        self.ctrl
    }

    pub fn debug_mask(&self) -> PpuMask {
        self.mask
    }

    pub fn debug_status(&self) -> PpuStatus {
        self.status
    }

    pub fn debug_scanline_cycle(&self) -> (i16, i16) {
        (self.scanline, self.cycle)
    }

    pub fn debug_vram_addr(&self) -> u16 {
        self.vram_addr.0
    }

    pub fn debug_peek_nametable(&self, index: usize) -> u8 {
        self.nametables[(index / 0x400) & 1][index % 0x400]
    }

    pub fn debug_peek_palette(&self, index: usize) -> u8 {
        self.palette_ram[index % 32]
    }

    pub fn debug_peek_oam(&self, index: usize) -> u8 {
        self.oam[index % 256]
    }

    pub fn sprite_count(&self) -> usize {
        self.sprite_count
    }

    pub fn cpu_read_register(&mut self, addr: u16, cart: &mut Cartridge) -> u8 {
        match addr & 0x0007 {
            0x0002 => {
                let value = (self.status.0 & 0xE0) | (self.data_buffer & 0x1F);
                self.status.set_vblank(false);
                self.write_toggle = false;
                value
            }
            0x0004 => self.oam[self.oam_addr as usize],
            0x0007 => {
                let addr = self.vram_addr.0 & 0x3FFF;
                let mut value = self.data_buffer;
                self.data_buffer = self.ppu_read(addr, cart);
                if addr >= 0x3F00 {
                    value = self.data_buffer;
                }
                self.increment_vram_addr();
                value
            }
            _ => 0,
        }
    }

    pub fn cpu_write_register(&mut self, addr: u16, value: u8, cart: &mut Cartridge) {
        match addr & 0x0007 {
            0x0000 => {
                self.ctrl = PpuCtrl(value);
                self.tram_addr.set_nametable_x(self.ctrl.nametable_x() as u16);
                self.tram_addr.set_nametable_y(self.ctrl.nametable_y() as u16);
            }
            0x0001 => self.mask = PpuMask(value),
            0x0003 => self.oam_addr = value,
            0x0004 => {
                self.oam[self.oam_addr as usize] = value;
                self.oam_addr = self.oam_addr.wrapping_add(1);
            }
            0x0005 => {
                if !self.write_toggle {
                    self.fine_x = value & 0x07;
                    self.tram_addr.set_coarse_x((value >> 3) as u16);
                } else {
                    self.tram_addr.set_fine_y((value & 0x07) as u16);
                    self.tram_addr.set_coarse_y((value >> 3) as u16);
                }
                self.write_toggle = !self.write_toggle;
            }
            0x0006 => {
                if !self.write_toggle {
                    self.tram_addr.0 = (((value & 0x3F) as u16) << 8) | (self.tram_addr.0 & 0x00FF);
                } else {
                    self.tram_addr.0 = (self.tram_addr.0 & 0xFF00) | value as u16;
                    self.vram_addr = self.tram_addr;
                }
                self.write_toggle = !self.write_toggle;
            }
            0x0007 => {
                let addr = self.vram_addr.0 & 0x3FFF;
                self.ppu_write(addr, value, cart);
                self.increment_vram_addr();
            }
            _ => {}
        }
    }

    /// One OAM byte from a DMA transfer, stored at `index`. `oam_addr` is
    /// left alone.
    pub fn write_oam_dma_byte(&mut self, index: u8, value: u8) {
        self.oam[index as usize] = value;
    }

    /// Advances one dot.
    pub fn tick(&mut self, cart: &mut Cartridge) {
        if (-1..240).contains(&self.scanline) {
            self.tick_render_line(cart);
        }

        if self.scanline == 241 && self.cycle == 1 {
            self.status.set_vblank(true);
            if self.ctrl.nmi_enabled() {
                self.nmi = true;
                trace!(target: "ppu", "vblank NMI raised");
            }
        }

        self.compose_pixel(cart);

        self.cycle += 1;
        if self.mask.rendering_enabled() && self.cycle == 260 && self.scanline < 240 {
            cart.on_scanline();
        }

        if self.cycle >= DOTS_PER_SCANLINE as i16 {
            self.cycle = 0;
            self.scanline += 1;
            if self.scanline >= 261 {
                self.scanline = -1;
                self.frame_complete = true;
                self.frame_count += 1;
            }
        }
    }

    fn tick_render_line(&mut self, cart: &mut Cartridge) {
        let cycle = self.cycle;

        if self.scanline == -1 && cycle == 1 {
            self.status.set_vblank(false);
            self.status.set_sprite_zero_hit(false);
            self.status.set_sprite_overflow(false);
            self.sprite_scanline = [SpriteEntry::EMPTY; 8];
            self.sprite_count = 0;
            self.sprite_patterns_lo = [0; 8];
            self.sprite_patterns_hi = [0; 8];
        }

        if (2..258).contains(&cycle) || (321..338).contains(&cycle) {
            self.update_shifters();
            match (cycle - 1) % 8 {
                0 => {
                    self.load_background_shifters();
                    self.next_tile_id = self.ppu_read(0x2000 | (self.vram_addr.0 & 0x0FFF), cart);
                }
                2 => {
                    let v = self.vram_addr;
                    let addr = 0x23C0
                        | (v.nametable_y() << 11)
                        | (v.nametable_x() << 10)
                        | ((v.coarse_y() >> 2) << 3)
                        | (v.coarse_x() >> 2);
                    let mut attr = self.ppu_read(addr, cart);
                    if v.coarse_y() & 0x02 != 0 {
                        attr >>= 4;
                    }
                    if v.coarse_x() & 0x02 != 0 {
                        attr >>= 2;
                    }
                    self.next_tile_attr = attr & 0x03;
                }
                4 => {
                    let addr = self.background_pattern_addr();
                    self.next_tile_lsb = self.ppu_read(addr, cart);
                }
                6 => {
                    let addr = self.background_pattern_addr() + 8;
                    self.next_tile_msb = self.ppu_read(addr, cart);
                }
                7 => self.increment_scroll_x(),
                _ => {}
            }
        }

        if cycle == 256 {
            self.increment_scroll_y();
        }

        if cycle == 257 {
            self.load_background_shifters();
            self.transfer_address_x();
        }

        if cycle == 338 || cycle == 340 {
            self.next_tile_id = self.ppu_read(0x2000 | (self.vram_addr.0 & 0x0FFF), cart);
        }

        if self.scanline == -1 && (280..305).contains(&cycle) {
            self.transfer_address_y();
        }

        if cycle == 257 && self.scanline >= 0 {
            self.evaluate_sprites();
        }

        if cycle == 340 && self.scanline >= 0 {
            self.fetch_sprite_patterns(cart);
        }
    }

    fn background_pattern_addr(&self) -> u16 {
        self.ctrl.background_table() + ((self.next_tile_id as u16) << 4) + self.vram_addr.fine_y()
    }

    fn evaluate_sprites(&mut self) {
        self.sprite_scanline = [SpriteEntry::EMPTY; 8];
        self.sprite_patterns_lo = [0; 8];
        self.sprite_patterns_hi = [0; 8];
        self.sprite_count = 0;
        self.sprite_zero_hit_possible = false;

        let height = if self.ctrl.sprite_size_16() { 16 } else { 8 };
        for index in 0..64 {
            let diff = self.scanline - self.oam[index * 4] as i16;
            if !(0..height).contains(&diff) {
                continue;
            }
            if self.sprite_count == 8 {
                self.status.set_sprite_overflow(true);
                break;
            }
            if index == 0 {
                self.sprite_zero_hit_possible = true;
            }
            self.sprite_scanline[self.sprite_count] = SpriteEntry::from_oam(&self.oam, index);
            self.sprite_count += 1;
        }
    }

    fn fetch_sprite_patterns(&mut self, cart: &mut Cartridge) {
        for i in 0..self.sprite_count {
            let sprite = self.sprite_scanline[i];
            // Row stays inside the tile even if the sprite size changed after evaluation.
            let row = (self.scanline - sprite.y as i16) as u16 & 0x0F;
            let flip_v = sprite.attributes & 0x80 != 0;
            let tile = sprite.tile as u16;

            let addr_lo = if !self.ctrl.sprite_size_16() {
                let row = row & 0x07;
                let line = if flip_v { 7 - row } else { row };
                self.ctrl.sprite_table() | (tile << 4) | (line & 0x07)
            } else {
                let table = (tile & 0x01) << 12;
                let line = if flip_v { 15 - row } else { row };
                let half = if line < 8 { 0 } else { 1 };
                table | (((tile & 0xFE) + half) << 4) | (line & 0x07)
            };

            let mut lo = self.ppu_read(addr_lo, cart);
            let mut hi = self.ppu_read(addr_lo.wrapping_add(8), cart);
            if sprite.attributes & 0x40 != 0 {
                lo = lo.reverse_bits();
                hi = hi.reverse_bits();
            }
            self.sprite_patterns_lo[i] = lo;
            self.sprite_patterns_hi[i] = hi;
        }
    }

    fn compose_pixel(&mut self, cart: &Cartridge) {
        let mut bg_pixel = 0u8;
        let mut bg_palette = 0u8;
        if self.mask.show_background() {
            let mux = 0x8000u16 >> self.fine_x;
            let p0 = ((self.bg_shift_pattern_lo & mux) != 0) as u8;
            let p1 = ((self.bg_shift_pattern_hi & mux) != 0) as u8;
            bg_pixel = (p1 << 1) | p0;
            let a0 = ((self.bg_shift_attr_lo & mux) != 0) as u8;
            let a1 = ((self.bg_shift_attr_hi & mux) != 0) as u8;
            bg_palette = (a1 << 1) | a0;
        }

        let mut fg_pixel = 0u8;
        let mut fg_palette = 0u8;
        let mut fg_front = false;
        if self.mask.show_sprites() {
            self.sprite_zero_being_rendered = false;
            for i in 0..self.sprite_count {
                let sprite = self.sprite_scanline[i];
                if sprite.x != 0 {
                    continue;
                }
                let lo = (self.sprite_patterns_lo[i] & 0x80 != 0) as u8;
                let hi = (self.sprite_patterns_hi[i] & 0x80 != 0) as u8;
                fg_pixel = (hi << 1) | lo;
                fg_palette = (sprite.attributes & 0x03) + 0x04;
                fg_front = sprite.attributes & 0x20 == 0;
                if fg_pixel != 0 {
                    if i == 0 {
                        self.sprite_zero_being_rendered = true;
                    }
                    break;
                }
            }
        }

        let (pixel, palette) = match (bg_pixel, fg_pixel) {
            (0, 0) => (0, 0),
            (0, _) => (fg_pixel, fg_palette),
            (_, 0) => (bg_pixel, bg_palette),
            _ => {
                if self.sprite_zero_hit_possible
                    && self.sprite_zero_being_rendered
                    && self.mask.show_background()
                    && self.mask.show_sprites()
                {
                    let first_dot = if self.mask.show_background_left() && self.mask.show_sprites_left() {
                        1
                    } else {
                        9
                    };
                    if (first_dot..258).contains(&self.cycle) {
                        self.status.set_sprite_zero_hit(true);
                    }
                }
                if fg_front {
                    (fg_pixel, fg_palette)
                } else {
                    (bg_pixel, bg_palette)
                }
            }
        };

        let x = self.cycle - 1;
        let y = self.scanline;
        if (0..FRAME_WIDTH as i16).contains(&x) && (0..FRAME_HEIGHT as i16).contains(&y) {
            let index = self.palette_color(palette, pixel, cart);
            let offset = y as usize * FRAME_WIDTH + x as usize;
            self.frame_indices[offset] = index;
            let rgb = NES_PALETTE[index as usize];
            self.frame_buffer[offset * 4..offset * 4 + 4].copy_from_slice(&[rgb[0], rgb[1], rgb[2], 0xFF]);
        }
    }

    /// System palette index for a (palette, pixel) pair as the PPU would
    /// look it up.
    pub fn palette_color(&self, palette: u8, pixel: u8, cart: &Cartridge) -> u8 {
        let addr = 0x3F00 + ((palette as u16) << 2) + pixel as u16;
        self.ppu_read(addr, cart) & 0x3F
    }

    /// Renders a 128x128 RGBA view of pattern table `table` (0 or 1) into
    /// `out` using `palette` (0..=7).
    pub fn pattern_table(&self, table: u8, palette: u8, cart: &Cartridge, out: &mut [u8]) {
        let base = if table == 0 { 0x0000 } else { 0x1000 };
        let palette = palette & 0x07;
        for tile_y in 0..16u16 {
            for tile_x in 0..16u16 {
                let offset = tile_y * 256 + tile_x * 16;
                for row in 0..8u16 {
                    let mut lsb = self.ppu_read(base + offset + row, cart);
                    let mut msb = self.ppu_read(base + offset + row + 8, cart);
                    for col in 0..8u16 {
                        let pixel = ((msb & 0x01) << 1) | (lsb & 0x01);
                        lsb >>= 1;
                        msb >>= 1;

                        let x = (tile_x * 8 + (7 - col)) as usize;
                        let y = (tile_y * 8 + row) as usize;
                        let index = self.palette_color(palette, pixel, cart);
                        let rgb = NES_PALETTE[index as usize];
                        let at = (y * PATTERN_TABLE_SIZE + x) * 4;
                        if let Some(dst) = out.get_mut(at..at + 4) {
                            dst.copy_from_slice(&[rgb[0], rgb[1], rgb[2], 0xFF]);
                        }
                    }
                }
            }
        }
    }

    fn update_shifters(&mut self) {
        if self.mask.show_background() {
            self.bg_shift_pattern_lo <<= 1;
            self.bg_shift_pattern_hi <<= 1;
            self.bg_shift_attr_lo <<= 1;
            self.bg_shift_attr_hi <<= 1;
        }

        if self.mask.show_sprites() && (1..258).contains(&self.cycle) {
            for i in 0..self.sprite_count {
                if self.sprite_scanline[i].x > 0 {
                    self.sprite_scanline[i].x -= 1;
                } else {
                    self.sprite_patterns_lo[i] <<= 1;
                    self.sprite_patterns_hi[i] <<= 1;
                }
            }
        }
    }

    fn load_background_shifters(&mut self) {
        self.bg_shift_pattern_lo = (self.bg_shift_pattern_lo & 0xFF00) | self.next_tile_lsb as u16;
        self.bg_shift_pattern_hi = (self.bg_shift_pattern_hi & 0xFF00) | self.next_tile_msb as u16;
        let attr_lo = if self.next_tile_attr & 0x01 != 0 { 0xFF } else { 0x00 };
        let attr_hi = if self.next_tile_attr & 0x02 != 0 { 0xFF } else { 0x00 };
        self.bg_shift_attr_lo = (self.bg_shift_attr_lo & 0xFF00) | attr_lo;
        self.bg_shift_attr_hi = (self.bg_shift_attr_hi & 0xFF00) | attr_hi;
    }

    fn increment_scroll_x(&mut self) {
        if !self.mask.rendering_enabled() {
            return;
        }
        if self.vram_addr.coarse_x() == 31 {
            self.vram_addr.set_coarse_x(0);
            self.vram_addr.set_nametable_x(self.vram_addr.nametable_x() ^ 1);
        } else {
            self.vram_addr.set_coarse_x(self.vram_addr.coarse_x() + 1);
        }
    }

    fn increment_scroll_y(&mut self) {
        if !self.mask.rendering_enabled() {
            return;
        }
        if self.vram_addr.fine_y() < 7 {
            self.vram_addr.set_fine_y(self.vram_addr.fine_y() + 1);
            return;
        }

        self.vram_addr.set_fine_y(0);
        match self.vram_addr.coarse_y() {
            29 => {
                self.vram_addr.set_coarse_y(0);
                self.vram_addr.set_nametable_y(self.vram_addr.nametable_y() ^ 1);
            }
            31 => self.vram_addr.set_coarse_y(0),
            coarse_y => self.vram_addr.set_coarse_y(coarse_y + 1),
        }
    }

    fn transfer_address_x(&mut self) {
        if self.mask.rendering_enabled() {
            self.vram_addr.set_nametable_x(self.tram_addr.nametable_x());
            self.vram_addr.set_coarse_x(self.tram_addr.coarse_x());
        }
    }

    fn transfer_address_y(&mut self) {
        if self.mask.rendering_enabled() {
            self.vram_addr.set_fine_y(self.tram_addr.fine_y());
            self.vram_addr.set_nametable_y(self.tram_addr.nametable_y());
            self.vram_addr.set_coarse_y(self.tram_addr.coarse_y());
        }
    }

    fn increment_vram_addr(&mut self) {
        let step = if self.ctrl.increment_32() { 32 } else { 1 };
        self.vram_addr.0 = self.vram_addr.0.wrapping_add(step) & 0x7FFF;
    }

    fn ppu_read(&self, addr: u16, cart: &Cartridge) -> u8 {
        let addr = addr & 0x3FFF;
        if let Some(value) = cart.ppu_read(addr) {
            return value;
        }
        match addr {
            0x0000..=0x1FFF => {
                self.pattern_fallback[((addr & 0x1000) >> 12) as usize][(addr & 0x0FFF) as usize]
            }
            0x2000..=0x3EFF => {
                let (table, offset) = nametable_slot(addr, cart.mirroring());
                self.nametables[table][offset]
            }
            _ => {
                let mask = if self.mask.grayscale() { 0x30 } else { 0x3F };
                self.palette_ram[palette_index(addr)] & mask
            }
        }
    }

    fn ppu_write(&mut self, addr: u16, value: u8, cart: &mut Cartridge) {
        let addr = addr & 0x3FFF;
        if cart.ppu_write(addr, value) {
            return;
        }
        match addr {
            0x0000..=0x1FFF => {
                self.pattern_fallback[((addr & 0x1000) >> 12) as usize][(addr & 0x0FFF) as usize] =
                    value;
            }
            0x2000..=0x3EFF => {
                let (table, offset) = nametable_slot(addr, cart.mirroring());
                self.nametables[table][offset] = value;
            }
            _ => self.palette_ram[palette_index(addr)] = value,
        }
    }
}

fn palette_index(addr: u16) -> usize {
    let index = (addr & 0x001F) as usize;
    // $3F10/$14/$18/$1C alias the backdrop entries.
    if index >= 0x10 && index & 0x03 == 0 {
        index - 0x10
    } else {
        index
    }
}

fn nametable_slot(addr: u16, mirroring: Mirroring) -> (usize, usize) {
    let addr = addr & 0x0FFF;
    let logical = (addr / 0x400) as usize;
    let offset = (addr & 0x03FF) as usize;
    let table = match mirroring {
        Mirroring::Vertical => logical & 0x01,
        Mirroring::Horizontal | Mirroring::Hardware => logical >> 1,
        Mirroring::OneScreenLow => 0,
        Mirroring::OneScreenHigh => 1,
    };
    (table, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::cartridge::tests::build_rom;

    fn chr_ram_cart() -> Cartridge {
        Cartridge::from_bytes(&build_rom(0, 1, 0, 0)).unwrap()
    }

    fn tick_until(ppu: &mut Ppu, cart: &mut Cartridge, scanline: i16, cycle: i16) {
        while ppu.debug_scanline_cycle() != (scanline, cycle) {
            ppu.tick(cart);
        }
    }

    fn set_vram_addr(ppu: &mut Ppu, cart: &mut Cartridge, addr: u16) {
        ppu.cpu_write_register(0x2006, (addr >> 8) as u8, cart);
        ppu.cpu_write_register(0x2006, addr as u8, cart);
    }

    #[test]
    fn frame_is_341_by_262_dots() {
        let mut ppu = Ppu::new();
        let mut cart = chr_ram_cart();
        ppu.cpu_write_register(0x2001, 0x18, &mut cart);

        while !ppu.frame_complete() {
            ppu.tick(&mut cart);
        }
        ppu.clear_frame_complete();

        let mut ticks = 0u32;
        while !ppu.frame_complete() {
            ppu.tick(&mut cart);
            ticks += 1;
        }
        assert_eq!(ticks, DOTS_PER_SCANLINE * SCANLINES_PER_FRAME);
        assert_eq!(ppu.debug_scanline_cycle(), (-1, 0));
    }

    #[test]
    fn vblank_sets_at_241_1_and_nmi_follows_ctrl() {
        let mut ppu = Ppu::new();
        let mut cart = chr_ram_cart();

        tick_until(&mut ppu, &mut cart, 241, 1);
        assert!(!ppu.debug_status().vblank());
        ppu.tick(&mut cart);
        assert!(ppu.debug_status().vblank());
        assert!(!ppu.take_nmi());

        ppu.cpu_write_register(0x2000, 0x80, &mut cart);
        tick_until(&mut ppu, &mut cart, 241, 1);
        ppu.tick(&mut cart);
        assert!(ppu.take_nmi());
        assert!(!ppu.take_nmi());
    }

    #[test]
    fn status_read_clears_vblank_and_write_toggle() {
        let mut ppu = Ppu::new();
        let mut cart = chr_ram_cart();
        tick_until(&mut ppu, &mut cart, 241, 2);

        // Leave the toggle half-way through a $2006 pair.
        ppu.cpu_write_register(0x2006, 0x3F, &mut cart);
        let status = ppu.cpu_read_register(0x2002, &mut cart);
        assert_eq!(status & 0x80, 0x80);
        assert!(!ppu.debug_status().vblank());

        set_vram_addr(&mut ppu, &mut cart, 0x2123);
        assert_eq!(ppu.debug_vram_addr(), 0x2123);
    }

    #[test]
    fn vblank_clears_on_prerender_line() {
        let mut ppu = Ppu::new();
        let mut cart = chr_ram_cart();
        tick_until(&mut ppu, &mut cart, 241, 2);
        assert!(ppu.debug_status().vblank());
        tick_until(&mut ppu, &mut cart, -1, 2);
        assert!(!ppu.debug_status().vblank());
    }

    #[test]
    fn ppudata_reads_are_buffered_except_palette() {
        let mut ppu = Ppu::new();
        let mut cart = chr_ram_cart();

        set_vram_addr(&mut ppu, &mut cart, 0x2000);
        ppu.cpu_write_register(0x2007, 0x11, &mut cart);
        ppu.cpu_write_register(0x2007, 0x22, &mut cart);

        set_vram_addr(&mut ppu, &mut cart, 0x2000);
        let _stale = ppu.cpu_read_register(0x2007, &mut cart);
        assert_eq!(ppu.cpu_read_register(0x2007, &mut cart), 0x11);
        assert_eq!(ppu.cpu_read_register(0x2007, &mut cart), 0x22);

        set_vram_addr(&mut ppu, &mut cart, 0x3F01);
        ppu.cpu_write_register(0x2007, 0x2A, &mut cart);
        set_vram_addr(&mut ppu, &mut cart, 0x3F01);
        assert_eq!(ppu.cpu_read_register(0x2007, &mut cart), 0x2A);

        ppu.cpu_write_register(0x2001, 0x01, &mut cart);
        set_vram_addr(&mut ppu, &mut cart, 0x3F01);
        assert_eq!(ppu.cpu_read_register(0x2007, &mut cart), 0x20);
    }

    #[test]
    fn ppudata_increment_follows_ctrl() {
        let mut ppu = Ppu::new();
        let mut cart = chr_ram_cart();
        ppu.cpu_write_register(0x2000, 0x04, &mut cart);
        set_vram_addr(&mut ppu, &mut cart, 0x2000);
        ppu.cpu_write_register(0x2007, 0x01, &mut cart);
        assert_eq!(ppu.debug_vram_addr(), 0x2020);
    }

    #[test]
    fn palette_mirrors_backdrop_entries() {
        let mut ppu = Ppu::new();
        let mut cart = chr_ram_cart();
        set_vram_addr(&mut ppu, &mut cart, 0x3F10);
        ppu.cpu_write_register(0x2007, 0x0F, &mut cart);
        assert_eq!(ppu.debug_peek_palette(0x00), 0x0F);
        assert_eq!(ppu.palette_color(4, 0, &cart), 0x0F);
    }

    #[test]
    fn horizontal_mirroring_shares_top_nametables() {
        let mut ppu = Ppu::new();
        let mut cart = chr_ram_cart();
        set_vram_addr(&mut ppu, &mut cart, 0x2405);
        ppu.cpu_write_register(0x2007, 0x77, &mut cart);
        assert_eq!(ppu.debug_peek_nametable(0x005), 0x77);
        assert_eq!(nametable_slot(0x2C05, Mirroring::Horizontal), (1, 5));
        assert_eq!(nametable_slot(0x2C05, Mirroring::Vertical), (1, 5));
        assert_eq!(nametable_slot(0x2805, Mirroring::Vertical), (0, 5));
        assert_eq!(nametable_slot(0x2805, Mirroring::OneScreenHigh), (1, 5));
    }

    #[test]
    fn ninth_sprite_sets_overflow_and_only_eight_are_kept() {
        let mut ppu = Ppu::new();
        let mut cart = chr_ram_cart();
        for i in 0..64u8 {
            ppu.cpu_write_register(0x2003, i * 4, &mut cart);
            let y = if i < 9 { 20 } else { 0xF0 };
            ppu.cpu_write_register(0x2004, y, &mut cart);
        }
        ppu.cpu_write_register(0x2001, 0x18, &mut cart);

        tick_until(&mut ppu, &mut cart, 20, 258);
        assert!(ppu.debug_status().sprite_overflow());
        assert_eq!(ppu.sprite_count(), 8);

        tick_until(&mut ppu, &mut cart, -1, 2);
        assert!(!ppu.debug_status().sprite_overflow());
    }

    #[test]
    fn eight_sprites_do_not_overflow() {
        let mut ppu = Ppu::new();
        let mut cart = chr_ram_cart();
        for i in 0..64u8 {
            ppu.cpu_write_register(0x2003, i * 4, &mut cart);
            let y = if i < 8 { 20 } else { 0xF0 };
            ppu.cpu_write_register(0x2004, y, &mut cart);
        }
        ppu.cpu_write_register(0x2001, 0x18, &mut cart);

        tick_until(&mut ppu, &mut cart, 20, 258);
        assert!(!ppu.debug_status().sprite_overflow());
        assert_eq!(ppu.sprite_count(), 8);
    }

    #[test]
    fn backdrop_fills_frame_when_rendering_disabled() {
        let mut ppu = Ppu::new();
        let mut cart = chr_ram_cart();
        set_vram_addr(&mut ppu, &mut cart, 0x3F00);
        ppu.cpu_write_register(0x2007, 0x21, &mut cart);

        while !ppu.frame_complete() {
            ppu.tick(&mut cart);
        }
        assert!(ppu.frame_indices().iter().all(|&index| index == 0x21));
        assert_eq!(&ppu.frame_buffer()[0..4], &[0x53, 0xAE, 0xFF, 0xFF]);
    }

    #[test]
    fn pattern_table_decodes_plane_order() {
        let mut ppu = Ppu::new();
        let mut cart = chr_ram_cart();
        // Tile 0 row 0: leftmost pixel has only the high plane set.
        cart.ppu_write(0x0008, 0x80);
        for (i, colour) in [0x0F, 0x01, 0x02, 0x03].into_iter().enumerate() {
            set_vram_addr(&mut ppu, &mut cart, 0x3F00 + i as u16);
            ppu.cpu_write_register(0x2007, colour, &mut cart);
        }

        let mut out = vec![0u8; PATTERN_TABLE_SIZE * PATTERN_TABLE_SIZE * 4];
        ppu.pattern_table(0, 0, &cart, &mut out);
        let expected = NES_PALETTE[0x02];
        assert_eq!(&out[0..3], &expected);
        let backdrop = NES_PALETTE[0x0F];
        assert_eq!(&out[4..7], &backdrop);
    }

    const PALETTE: [u8; 20] = [
        0x0F, 0x01, 0x02, 0x03, 0x0F, 0x05, 0x06, 0x07, 0x0F, 0x09, 0x0A, 0x0B, 0x0F, 0x0D, 0x0E,
        0x0F, 0x0F, 0x11, 0x12, 0x13,
    ];

    fn write_vram(ppu: &mut Ppu, cart: &mut Cartridge, addr: u16, bytes: &[u8]) {
        set_vram_addr(ppu, cart, addr);
        for &byte in bytes {
            ppu.cpu_write_register(0x2007, byte, cart);
        }
    }

    /// Tile 1 is solid pixel 1, tile 2 solid pixel 3, tile 3 a single
    /// pixel 1 in its top-left corner.
    fn load_tiles(ppu: &mut Ppu, cart: &mut Cartridge) {
        write_vram(ppu, cart, 0x0010, &[0xFF; 8]);
        write_vram(ppu, cart, 0x0020, &[0xFF; 16]);
        write_vram(ppu, cart, 0x0030, &[0x80]);
        write_vram(ppu, cart, 0x3F00, &PALETTE);
    }

    /// Fills OAM with off-screen sprites, then places `sprites` from index 0.
    fn load_oam(ppu: &mut Ppu, cart: &mut Cartridge, sprites: &[[u8; 4]]) {
        let mut oam = [0xF0u8; 256];
        for (i, sprite) in sprites.iter().enumerate() {
            oam[i * 4..i * 4 + 4].copy_from_slice(sprite);
        }
        ppu.cpu_write_register(0x2003, 0, cart);
        for byte in oam {
            ppu.cpu_write_register(0x2004, byte, cart);
        }
    }

    fn start_rendering(ppu: &mut Ppu, cart: &mut Cartridge, ctrl: u8, mask: u8) {
        ppu.cpu_read_register(0x2002, cart);
        ppu.cpu_write_register(0x2000, ctrl, cart);
        ppu.cpu_write_register(0x2005, 0, cart);
        ppu.cpu_write_register(0x2005, 0, cart);
        ppu.cpu_write_register(0x2001, mask, cart);
    }

    /// The first frame renders from whatever address setup left in `v`;
    /// the second starts from a proper pre-render line.
    fn render_two_frames(ppu: &mut Ppu, cart: &mut Cartridge) {
        for _ in 0..2 {
            while !ppu.frame_complete() {
                ppu.tick(cart);
            }
            ppu.clear_frame_complete();
        }
    }

    fn pixel(ppu: &Ppu, x: usize, y: usize) -> u8 {
        ppu.frame_indices()[y * FRAME_WIDTH + x]
    }

    #[test]
    fn background_tiles_use_their_attribute_palette() {
        let mut ppu = Ppu::new();
        let mut cart = chr_ram_cart();
        load_tiles(&mut ppu, &mut cart);
        write_vram(&mut ppu, &mut cart, 0x2002, &[0x01]);
        write_vram(&mut ppu, &mut cart, 0x2065, &[0x02]);
        // Top-right quadrant of the first attribute byte uses palette 1.
        write_vram(&mut ppu, &mut cart, 0x23C0, &[0x04]);
        load_oam(&mut ppu, &mut cart, &[]);
        start_rendering(&mut ppu, &mut cart, 0x00, 0x0A);
        render_two_frames(&mut ppu, &mut cart);

        for y in 0..8 {
            for x in 16..24 {
                assert_eq!(pixel(&ppu, x, y), 0x05, "tile 1 at ({x}, {y})");
            }
        }
        assert_eq!(pixel(&ppu, 15, 0), 0x0F);
        assert_eq!(pixel(&ppu, 24, 0), 0x0F);
        assert_eq!(pixel(&ppu, 16, 8), 0x0F);

        for y in 24..32 {
            for x in 40..48 {
                assert_eq!(pixel(&ppu, x, y), 0x03, "tile 2 at ({x}, {y})");
            }
        }
        assert_eq!(pixel(&ppu, 39, 24), 0x0F);
        assert_eq!(pixel(&ppu, 48, 31), 0x0F);
    }

    #[test]
    fn only_first_eight_sprites_are_drawn() {
        let mut ppu = Ppu::new();
        let mut cart = chr_ram_cart();
        load_tiles(&mut ppu, &mut cart);
        let sprites: Vec<[u8; 4]> = (0..9u8).map(|i| [100, 0x02, 0x00, i * 16]).collect();
        load_oam(&mut ppu, &mut cart, &sprites);
        start_rendering(&mut ppu, &mut cart, 0x00, 0x1E);
        render_two_frames(&mut ppu, &mut cart);

        let row: Vec<u8> = (0..9).map(|i| pixel(&ppu, i * 16, 101)).collect();
        assert_eq!(row, [0x13, 0x13, 0x13, 0x13, 0x13, 0x13, 0x13, 0x13, 0x0F]);
        // Sprites appear one line below their OAM Y.
        assert_eq!(pixel(&ppu, 0, 100), 0x0F);
        assert_eq!(pixel(&ppu, 0, 108), 0x13);
        assert_eq!(pixel(&ppu, 0, 109), 0x0F);
    }

    #[test]
    fn sprite_flips_mirror_the_pattern() {
        let mut ppu = Ppu::new();
        let mut cart = chr_ram_cart();
        load_tiles(&mut ppu, &mut cart);
        load_oam(
            &mut ppu,
            &mut cart,
            &[
                [20, 0x03, 0x00, 10],
                [20, 0x03, 0x40, 30],
                [20, 0x03, 0x80, 50],
                [20, 0x03, 0xC0, 70],
            ],
        );
        start_rendering(&mut ppu, &mut cart, 0x00, 0x1E);
        render_two_frames(&mut ppu, &mut cart);

        assert_eq!(pixel(&ppu, 10, 21), 0x11);
        assert_eq!(pixel(&ppu, 37, 21), 0x11);
        assert_eq!(pixel(&ppu, 50, 28), 0x11);
        assert_eq!(pixel(&ppu, 77, 28), 0x11);
        let lit = ppu.frame_indices().iter().filter(|&&index| index == 0x11).count();
        assert_eq!(lit, 4);
    }

    #[test]
    fn tall_sprites_span_two_tiles_from_odd_table() {
        let mut ppu = Ppu::new();
        let mut cart = chr_ram_cart();
        load_tiles(&mut ppu, &mut cart);
        // Tile $05 in 8x16 mode: top half tile 4, bottom half tile 5 of $1000.
        write_vram(&mut ppu, &mut cart, 0x1040, &[0xFF; 8]);
        write_vram(&mut ppu, &mut cart, 0x1058, &[0xFF; 8]);
        load_oam(
            &mut ppu,
            &mut cart,
            &[[60, 0x05, 0x00, 100], [60, 0x05, 0x80, 140]],
        );
        start_rendering(&mut ppu, &mut cart, 0x20, 0x1E);
        render_two_frames(&mut ppu, &mut cart);

        for y in 61..69 {
            assert_eq!(pixel(&ppu, 100, y), 0x11, "upright top at line {y}");
            assert_eq!(pixel(&ppu, 140, y), 0x12, "flipped top at line {y}");
        }
        for y in 69..77 {
            assert_eq!(pixel(&ppu, 100, y), 0x12, "upright bottom at line {y}");
            assert_eq!(pixel(&ppu, 140, y), 0x11, "flipped bottom at line {y}");
        }
        assert_eq!(pixel(&ppu, 100, 77), 0x0F);
    }

    #[test]
    fn sprite_priority_against_opaque_background() {
        let mut ppu = Ppu::new();
        let mut cart = chr_ram_cart();
        load_tiles(&mut ppu, &mut cart);
        write_vram(&mut ppu, &mut cart, 0x2000, &[0x01; 960]);
        load_oam(
            &mut ppu,
            &mut cart,
            &[[0xF0, 0x00, 0x00, 0x00], [50, 0x02, 0x20, 40], [50, 0x02, 0x00, 80]],
        );
        start_rendering(&mut ppu, &mut cart, 0x00, 0x1E);
        render_two_frames(&mut ppu, &mut cart);

        assert_eq!(pixel(&ppu, 40, 51), 0x01);
        assert_eq!(pixel(&ppu, 47, 58), 0x01);
        assert_eq!(pixel(&ppu, 80, 51), 0x13);
        assert_eq!(pixel(&ppu, 87, 58), 0x13);
        assert_eq!(pixel(&ppu, 88, 51), 0x01);
    }

    fn sprite_zero_hit_with(mask: u8, sprite_x: u8) -> bool {
        let mut ppu = Ppu::new();
        let mut cart = chr_ram_cart();
        load_tiles(&mut ppu, &mut cart);
        write_vram(&mut ppu, &mut cart, 0x2000, &[0x01; 960]);
        load_oam(&mut ppu, &mut cart, &[[100, 0x02, 0x00, sprite_x]]);
        start_rendering(&mut ppu, &mut cart, 0x00, mask);
        render_two_frames(&mut ppu, &mut cart);
        ppu.debug_status().sprite_zero_hit()
    }

    #[test]
    fn sprite_zero_hit_respects_left_column_clipping() {
        assert!(sprite_zero_hit_with(0x1E, 0));
        // Clipped: the sprite covers only x 0..=7, so no dot reaches 9.
        assert!(!sprite_zero_hit_with(0x18, 0));
        assert!(!sprite_zero_hit_with(0x1A, 0));
        // One pixel further right reaches x 8 (dot 9).
        assert!(sprite_zero_hit_with(0x18, 1));
    }

    #[test]
    fn sprite_zero_hit_needs_both_layers() {
        assert!(!sprite_zero_hit_with(0x14, 0));
        assert!(!sprite_zero_hit_with(0x0A, 0));
    }

    #[test]
    fn flipped_sprites_near_bottom_do_not_leak_into_next_frame() {
        for ctrl in [0x00, 0x20] {
            let mut ppu = Ppu::new();
            let mut cart = chr_ram_cart();
            load_tiles(&mut ppu, &mut cart);
            write_vram(&mut ppu, &mut cart, 0x0030, &[0xFF; 16]);
            load_oam(&mut ppu, &mut cart, &[[235, 0x02, 0x80, 0], [238, 0x02, 0xC0, 20]]);
            start_rendering(&mut ppu, &mut cart, ctrl, 0x10);
            render_two_frames(&mut ppu, &mut cart);

            assert_eq!(pixel(&ppu, 0, 239), 0x13, "ctrl {ctrl:#04X}");
            assert!(
                (0..FRAME_WIDTH).all(|x| pixel(&ppu, x, 0) == 0x0F),
                "ctrl {ctrl:#04X}: sprite pixels on line 0"
            );
        }
    }

    #[test]
    fn loopy_fields_round_trip() {
        let mut v = Loopy::default();
        v.set_coarse_x(31);
        v.set_coarse_y(29);
        v.set_nametable_x(1);
        v.set_nametable_y(1);
        v.set_fine_y(7);
        assert_eq!(v.0, 0x7FBF);
        assert_eq!((v.coarse_x(), v.coarse_y(), v.fine_y()), (31, 29, 7));
    }
}
