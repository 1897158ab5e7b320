//! Event blocks, interrupt controller layouts and error catalogs.
//!
//! Each module's event block has a status bitmap of `num_events` bits, a
//! set of broadcast-select registers and a group-error enable mask. Error
//! events sit at `base_error_event + n` for group-error bit `n`; the event
//! relayed up the column on broadcast line `b` is `base_bc_event + b`.

use std::fmt;

use bitflags::bitflags;

use super::tile::{ModuleType, TileKind};

/// Register field: mask plus offset relative to its block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegField {
    pub mask: u32,
    pub regoff: u32,
}

/// Event block layout of one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventAttr {
    /// Broadcast-select field, one register per broadcast line.
    pub bc_event: RegField,
    /// Group-error enable field, relative to `group_regoff`.
    pub group_error: RegField,
    pub bc_regoff: u32,
    pub status_regoff: u32,
    pub group_regoff: u32,
    pub base_error_event: u32,
    pub num_broadcasts: u32,
    pub base_bc_event: u32,
    pub num_events: u32,
}

impl EventAttr {
    /// Intra-tile offset of the group-error enable register.
    pub fn group_error_regoff(&self) -> u32 {
        self.group_regoff + self.group_error.regoff
    }

    /// Intra-tile offset of the status word holding `event`.
    pub fn status_word_regoff(&self, event: u32) -> u32 {
        self.status_regoff + (event / 32) * 4
    }

    /// Number of 32-bit status words.
    pub fn status_words(&self) -> u32 {
        self.num_events.div_ceil(32)
    }

    /// Intra-tile offset of the broadcast-select register for `bc_id`.
    pub fn bc_select_regoff(&self, bc_id: u32) -> u32 {
        self.bc_regoff + bc_id * 4 + self.bc_event.regoff
    }

    /// Event id that fires when broadcast line `bc_id` is driven from above.
    pub fn bc_event(&self, bc_id: u32) -> u32 {
        self.base_bc_event + bc_id
    }
}

/// Level-1 interrupt controller layout (one per shim column).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L1Attr {
    pub swa_status: RegField,
    pub swb_status: RegField,
    pub swa_event: RegField,
    pub swb_event: RegField,
    pub regoff: u32,
    pub event_lsb: u32,
    pub num_broadcasts: u32,
}

/// Level-2 interrupt controller layout (one per NOC shim column).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2Attr {
    pub mask: RegField,
    pub enable: RegField,
    pub disable: RegField,
    pub status: RegField,
    pub regoff: u32,
    pub num_broadcasts: u32,
}

/// Class of a hardware error event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Saturation,
    FloatingPoint,
    Stream,
    Access,
    Bus,
    Instruction,
    Ecc,
    Lock,
    Dma,
    MemParity,
    /// Recorded event with no catalog entry.
    Unclassified,
}

impl ErrorCategory {
    /// Flag form of this category.
    pub fn flag(self) -> ErrorCategories {
        match self {
            ErrorCategory::Saturation => ErrorCategories::SATURATION,
            ErrorCategory::FloatingPoint => ErrorCategories::FLOATING_POINT,
            ErrorCategory::Stream => ErrorCategories::STREAM,
            ErrorCategory::Access => ErrorCategories::ACCESS,
            ErrorCategory::Bus => ErrorCategories::BUS,
            ErrorCategory::Instruction => ErrorCategories::INSTRUCTION,
            ErrorCategory::Ecc => ErrorCategories::ECC,
            ErrorCategory::Lock => ErrorCategories::LOCK,
            ErrorCategory::Dma => ErrorCategories::DMA,
            ErrorCategory::MemParity => ErrorCategories::MEM_PARITY,
            ErrorCategory::Unclassified => ErrorCategories::UNCLASSIFIED,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Saturation => "saturation",
            ErrorCategory::FloatingPoint => "floating-point",
            ErrorCategory::Stream => "stream",
            ErrorCategory::Access => "access",
            ErrorCategory::Bus => "bus",
            ErrorCategory::Instruction => "instruction",
            ErrorCategory::Ecc => "ecc",
            ErrorCategory::Lock => "lock",
            ErrorCategory::Dma => "dma",
            ErrorCategory::MemParity => "memory-parity",
            ErrorCategory::Unclassified => "unclassified",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Set of error categories seen in a partition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ErrorCategories: u32 {
        const SATURATION     = 1 << 0;
        const FLOATING_POINT = 1 << 1;
        const STREAM         = 1 << 2;
        const ACCESS         = 1 << 3;
        const BUS            = 1 << 4;
        const INSTRUCTION    = 1 << 5;
        const ECC            = 1 << 6;
        const LOCK           = 1 << 7;
        const DMA            = 1 << 8;
        const MEM_PARITY     = 1 << 9;
        const UNCLASSIFIED   = 1 << 31;
    }
}

/// Named error event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventProp {
    pub event: u32,
    pub name: &'static str,
}

/// Error events of one category.
#[derive(Debug, Clone, Copy)]
pub struct CategoryEvents {
    pub category: ErrorCategory,
    pub events: &'static [EventProp],
}

/// Event block a (tile kind, module) pair reports into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventDomain {
    Core,
    Memory,
    MemTile,
    Pl,
}

impl EventDomain {
    pub const ALL: [EventDomain; 4] = [
        EventDomain::Core,
        EventDomain::Memory,
        EventDomain::MemTile,
        EventDomain::Pl,
    ];

    /// Domain of `module` in a tile of `kind`, if the module exists there.
    pub fn of(kind: TileKind, module: ModuleType) -> Option<Self> {
        match (kind, module) {
            (TileKind::ArrayTile, ModuleType::Core) => Some(EventDomain::Core),
            (TileKind::ArrayTile, ModuleType::Memory) => Some(EventDomain::Memory),
            (TileKind::MemoryTile, ModuleType::Memory) => Some(EventDomain::MemTile),
            (TileKind::ShimPlain | TileKind::ShimNoc, ModuleType::Pl) => Some(EventDomain::Pl),
            _ => None,
        }
    }

    /// Module reported for events of this domain.
    pub fn module(self) -> ModuleType {
        match self {
            EventDomain::Core => ModuleType::Core,
            EventDomain::Memory | EventDomain::MemTile => ModuleType::Memory,
            EventDomain::Pl => ModuleType::Pl,
        }
    }
}

/// All event and interrupt tables of one device generation.
#[derive(Debug)]
pub struct EventTables {
    pub core: EventAttr,
    pub mem: EventAttr,
    pub memtile: Option<EventAttr>,
    pub pl: EventAttr,
    pub l1: L1Attr,
    pub l2: L2Attr,
    pub core_errors: &'static [CategoryEvents],
    pub mem_errors: &'static [CategoryEvents],
    pub memtile_errors: &'static [CategoryEvents],
    pub shim_errors: &'static [CategoryEvents],
}

impl EventTables {
    /// Event block layout for a domain.
    pub fn attr(&self, domain: EventDomain) -> Option<&EventAttr> {
        match domain {
            EventDomain::Core => Some(&self.core),
            EventDomain::Memory => Some(&self.mem),
            EventDomain::MemTile => self.memtile.as_ref(),
            EventDomain::Pl => Some(&self.pl),
        }
    }

    /// Error catalog for a domain.
    pub fn errors(&self, domain: EventDomain) -> &'static [CategoryEvents] {
        match domain {
            EventDomain::Core => self.core_errors,
            EventDomain::Memory => self.mem_errors,
            EventDomain::MemTile => self.memtile_errors,
            EventDomain::Pl => self.shim_errors,
        }
    }

    /// Category and name of an event, if it is a catalogued error.
    pub fn classify(&self, domain: EventDomain, event: u32) -> Option<(ErrorCategory, &'static str)> {
        self.errors(domain).iter().find_map(|cat| {
            cat.events
                .iter()
                .find(|prop| prop.event == event)
                .map(|prop| (cat.category, prop.name))
        })
    }
}

// ============================================================================
// Shared layouts
// ============================================================================

const BC_EVENT_FIELD: RegField = RegField { mask: 0x7f, regoff: 0 };

const L1_CTRL: L1Attr = L1Attr {
    swa_status: RegField { mask: 0x000f_ffff, regoff: 0xc },
    swb_status: RegField { mask: 0x000f_ffff, regoff: 0x3c },
    swa_event: RegField { mask: 0x7f, regoff: 0x14 },
    swb_event: RegField { mask: 0x7f, regoff: 0x44 },
    regoff: 0x0003_5000,
    event_lsb: 8,
    num_broadcasts: 20,
};

const L2_CTRL: L2Attr = L2Attr {
    mask: RegField { mask: 0xffff, regoff: 0x0 },
    enable: RegField { mask: 0xffff, regoff: 0x4 },
    disable: RegField { mask: 0xffff, regoff: 0x8 },
    status: RegField { mask: 0xffff, regoff: 0xc },
    regoff: 0x0001_5000,
    num_broadcasts: 16,
};

const fn prop(event: u32, name: &'static str) -> EventProp {
    EventProp { event, name }
}

// ============================================================================
// AIE
// ============================================================================

static AIE_CORE_ERRORS: [CategoryEvents; 6] = [
    CategoryEvents {
        category: ErrorCategory::Stream,
        events: &[
            prop(54, "tlast_in_wss_words_0-2"),
            prop(57, "control_packet_error"),
            prop(56, "stream_packet_parity_error"),
        ],
    },
    CategoryEvents {
        category: ErrorCategory::Access,
        events: &[
            prop(55, "pm_reg_access_failure"),
            prop(66, "dm_access_to_unavailable"),
            prop(65, "pm_address_out_of_range"),
            prop(60, "dm_address_out_of_range"),
        ],
    },
    CategoryEvents {
        category: ErrorCategory::Bus,
        events: &[prop(58, "axi-mm_slave_error")],
    },
    CategoryEvents {
        category: ErrorCategory::Instruction,
        events: &[prop(59, "instruction_decompression_error")],
    },
    CategoryEvents {
        category: ErrorCategory::Ecc,
        events: &[
            prop(64, "pm_ecc_error_2-bit"),
            prop(62, "pm_ecc_error_scrub_2-bit"),
        ],
    },
    CategoryEvents {
        category: ErrorCategory::Lock,
        events: &[prop(67, "lock_access_to_unavailable")],
    },
];

static AIE_MEM_ERRORS: [CategoryEvents; 3] = [
    CategoryEvents {
        category: ErrorCategory::Ecc,
        events: &[
            prop(88, "dm_ecc_error_scrub_2-bit"),
            prop(90, "dm_ecc_error_2-bit"),
        ],
    },
    CategoryEvents {
        category: ErrorCategory::MemParity,
        events: &[
            prop(91, "dm_parity_error_bank_2"),
            prop(92, "dm_parity_error_bank_3"),
            prop(93, "dm_parity_error_bank_4"),
            prop(94, "dm_parity_error_bank_5"),
            prop(95, "dm_parity_error_bank_6"),
            prop(96, "dm_parity_error_bank_7"),
        ],
    },
    CategoryEvents {
        category: ErrorCategory::Dma,
        events: &[
            prop(97, "dma_s2mm_0_error"),
            prop(98, "dma_s2mm_1_error"),
            prop(99, "dma_mm2s_0_error"),
            prop(100, "dma_mm2s_1_error"),
        ],
    },
];

static AIE_SHIM_ERRORS: [CategoryEvents; 3] = [
    CategoryEvents {
        category: ErrorCategory::Bus,
        events: &[prop(62, "axi-mm_slave_tile_error")],
    },
    CategoryEvents {
        category: ErrorCategory::Stream,
        events: &[
            prop(63, "control_packet_error"),
            prop(64, "axi-mm_decode_nsu_error"),
            prop(65, "axi-mm_slave_nsu_error"),
            prop(66, "axi-mm_unsupported_traffic"),
            prop(67, "axi-mm_unsecure_access_in_secure_mode"),
            prop(68, "axi-mm_byte_strobe_error"),
        ],
    },
    CategoryEvents {
        category: ErrorCategory::Dma,
        events: &[
            prop(69, "dma_s2mm_0_error"),
            prop(70, "dma_s2mm_1_error"),
            prop(71, "dma_mm2s_0_error"),
            prop(72, "dma_mm2s_1_error"),
        ],
    },
];

pub static AIE_EVENTS: EventTables = EventTables {
    core: EventAttr {
        bc_event: BC_EVENT_FIELD,
        group_error: RegField { mask: 0x003f_ffff, regoff: 0x10 },
        bc_regoff: 0x0003_4010,
        status_regoff: 0x0003_4200,
        group_regoff: 0x0003_4500,
        base_error_event: 48,
        num_broadcasts: 16,
        base_bc_event: 107,
        num_events: 128,
    },
    mem: EventAttr {
        bc_event: BC_EVENT_FIELD,
        group_error: RegField { mask: 0x3fff, regoff: 0x14 },
        bc_regoff: 0x0001_4010,
        status_regoff: 0x0001_4200,
        group_regoff: 0x0001_4500,
        base_error_event: 87,
        num_broadcasts: 16,
        base_bc_event: 107,
        num_events: 128,
    },
    memtile: None,
    pl: EventAttr {
        bc_event: BC_EVENT_FIELD,
        group_error: RegField { mask: 0x07ff, regoff: 0xc },
        bc_regoff: 0x0003_4010,
        status_regoff: 0x0003_4200,
        group_regoff: 0x0003_4500,
        base_error_event: 62,
        num_broadcasts: 16,
        base_bc_event: 107,
        num_events: 128,
    },
    l1: L1_CTRL,
    l2: L2_CTRL,
    core_errors: &AIE_CORE_ERRORS,
    mem_errors: &AIE_MEM_ERRORS,
    memtile_errors: &[],
    shim_errors: &AIE_SHIM_ERRORS,
};

// ============================================================================
// AIE-ML
// ============================================================================

static AIEML_CORE_ERRORS: [CategoryEvents; 6] = [
    CategoryEvents {
        category: ErrorCategory::Stream,
        events: &[
            prop(71, "stream_switch_port_parity_error"),
            prop(57, "control_pkt_error"),
            prop(56, "stream_pkt_parity_error"),
        ],
    },
    CategoryEvents {
        category: ErrorCategory::Access,
        events: &[
            prop(55, "pm_reg_access_failure"),
            prop(60, "dm_address_out_of_range"),
            prop(65, "pm_address_out_of_range"),
            prop(66, "dm_access_to_unavailable"),
        ],
    },
    CategoryEvents {
        category: ErrorCategory::Bus,
        events: &[prop(58, "axi_mm_slave_error")],
    },
    CategoryEvents {
        category: ErrorCategory::Instruction,
        events: &[
            prop(59, "instruction_decompression_error"),
            prop(70, "decompression_underflow"),
        ],
    },
    CategoryEvents {
        category: ErrorCategory::Ecc,
        events: &[
            prop(64, "pm_ecc_error_2-bit"),
            prop(62, "pm_ecc_error_scrub_2-bit"),
        ],
    },
    CategoryEvents {
        category: ErrorCategory::Lock,
        events: &[
            prop(67, "lock_access_to_unavailable"),
            prop(72, "processor_bus_error"),
        ],
    },
];

static AIEML_MEM_ERRORS: [CategoryEvents; 3] = [
    CategoryEvents {
        category: ErrorCategory::Ecc,
        events: &[
            prop(88, "dm_ecc_error_scrub_2-bit"),
            prop(90, "dm_ecc_error_2-bit"),
        ],
    },
    CategoryEvents {
        category: ErrorCategory::MemParity,
        events: &[
            prop(96, "dm_parity_error_bank_7"),
            prop(95, "dm_parity_error_bank_6"),
            prop(94, "dm_parity_error_bank_5"),
            prop(93, "dm_parity_error_bank_4"),
            prop(92, "dm_parity_error_bank_3"),
            prop(91, "dm_parity_error_bank_2"),
        ],
    },
    CategoryEvents {
        category: ErrorCategory::Dma,
        events: &[
            prop(100, "dma_mm2s_1_error"),
            prop(99, "dma_mm2s_0_error"),
            prop(98, "dma_s2mm_1_error"),
            prop(97, "dma_s2mm_0_error"),
        ],
    },
];

static AIEML_MEMTILE_ERRORS: [CategoryEvents; 4] = [
    CategoryEvents {
        category: ErrorCategory::Ecc,
        events: &[
            prop(132, "dm_ecc_error_2-bit"),
            prop(130, "dm_ecc_error_scrub_2-bit"),
        ],
    },
    CategoryEvents {
        category: ErrorCategory::Dma,
        events: &[prop(134, "dma_mm2s_error"), prop(133, "dma_s2mm_error")],
    },
    CategoryEvents {
        category: ErrorCategory::Stream,
        events: &[
            prop(137, "control_pkt_error"),
            prop(136, "stream_pkt_parity_error"),
            prop(135, "stream_switch_port_parity_error"),
        ],
    },
    CategoryEvents {
        category: ErrorCategory::Lock,
        events: &[prop(139, "lock_error")],
    },
];

static AIEML_SHIM_ERRORS: [CategoryEvents; 3] = [
    CategoryEvents {
        category: ErrorCategory::Bus,
        events: &[
            prop(71, "axi_mm_byte_strobe_error"),
            prop(70, "axi_mm_unsecure_access_in_secure_mode"),
            prop(69, "axi_mm_unsupported_traffic"),
            prop(68, "axi_mm_slave_nsu_error"),
            prop(67, "axi_mm_decode_nsu_error"),
            prop(64, "axi_mm_slave_tile_error"),
        ],
    },
    CategoryEvents {
        category: ErrorCategory::Stream,
        events: &[
            prop(66, "stream_switch_port_parity_error"),
            prop(65, "control_pkt_error"),
        ],
    },
    CategoryEvents {
        category: ErrorCategory::Dma,
        events: &[prop(73, "dma_mm2s_error"), prop(72, "dma_s2mm_error")],
    },
];

pub static AIEML_EVENTS: EventTables = EventTables {
    core: EventAttr {
        bc_event: BC_EVENT_FIELD,
        group_error: RegField { mask: 0x01ff_ffff, regoff: 0x10 },
        bc_regoff: 0x0003_4010,
        status_regoff: 0x0003_4200,
        group_regoff: 0x0003_4500,
        base_error_event: 48,
        num_broadcasts: 16,
        base_bc_event: 107,
        num_events: 128,
    },
    mem: EventAttr {
        bc_event: BC_EVENT_FIELD,
        group_error: RegField { mask: 0xffff, regoff: 0x14 },
        bc_regoff: 0x0001_4010,
        status_regoff: 0x0001_4200,
        group_regoff: 0x0001_4500,
        base_error_event: 87,
        num_broadcasts: 16,
        base_bc_event: 107,
        num_events: 128,
    },
    memtile: Some(EventAttr {
        bc_event: RegField { mask: 0xff, regoff: 0 },
        group_error: RegField { mask: 0x0fff, regoff: 0x18 },
        bc_regoff: 0x0009_4010,
        status_regoff: 0x0009_4200,
        group_regoff: 0x0009_4500,
        base_error_event: 129,
        num_broadcasts: 16,
        base_bc_event: 142,
        num_events: 192,
    }),
    pl: EventAttr {
        bc_event: BC_EVENT_FIELD,
        group_error: RegField { mask: 0x0fff, regoff: 0xc },
        bc_regoff: 0x0003_4010,
        status_regoff: 0x0003_4200,
        group_regoff: 0x0003_4500,
        base_error_event: 64,
        num_broadcasts: 16,
        base_bc_event: 110,
        num_events: 128,
    },
    l1: L1_CTRL,
    l2: L2_CTRL,
    core_errors: &AIEML_CORE_ERRORS,
    mem_errors: &AIEML_MEM_ERRORS,
    memtile_errors: &AIEML_MEMTILE_ERRORS,
    shim_errors: &AIEML_SHIM_ERRORS,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_offsets() {
        let core = &AIE_EVENTS.core;
        assert_eq!(core.group_error_regoff(), 0x34510);
        assert_eq!(core.status_word_regoff(53), 0x34204);
        assert_eq!(core.bc_select_regoff(0), 0x34010);
        assert_eq!(core.bc_event(0), 107);
        assert_eq!(AIEML_EVENTS.memtile.unwrap().status_words(), 6);
    }

    #[test]
    fn test_classify_known_and_unknown() {
        assert_eq!(
            AIE_EVENTS.classify(EventDomain::Core, 54),
            Some((ErrorCategory::Stream, "tlast_in_wss_words_0-2"))
        );
        assert_eq!(
            AIE_EVENTS.classify(EventDomain::Memory, 92),
            Some((ErrorCategory::MemParity, "dm_parity_error_bank_3"))
        );
        assert_eq!(AIE_EVENTS.classify(EventDomain::Core, 53), None);
        assert_eq!(AIE_EVENTS.classify(EventDomain::MemTile, 132), None);
        assert_eq!(
            AIEML_EVENTS.classify(EventDomain::MemTile, 139),
            Some((ErrorCategory::Lock, "lock_error"))
        );
    }

    #[test]
    fn test_error_events_fit_group_masks() {
        for tables in [&AIE_EVENTS, &AIEML_EVENTS] {
            for domain in EventDomain::ALL {
                let Some(attr) = tables.attr(domain) else { continue };
                let width = 32 - attr.group_error.mask.leading_zeros();
                for cat in tables.errors(domain) {
                    for prop in cat.events {
                        assert!(prop.event >= attr.base_error_event, "{:?} {}", domain, prop.name);
                        assert!(prop.event < attr.base_error_event + width, "{:?} {}", domain, prop.name);
                    }
                }
            }
        }
    }

    #[test]
    fn test_domain_of() {
        assert_eq!(EventDomain::of(TileKind::ArrayTile, ModuleType::Core), Some(EventDomain::Core));
        assert_eq!(EventDomain::of(TileKind::MemoryTile, ModuleType::Memory), Some(EventDomain::MemTile));
        assert_eq!(EventDomain::of(TileKind::ShimNoc, ModuleType::Core), None);
        assert_eq!(EventDomain::MemTile.module(), ModuleType::Memory);
    }
}
