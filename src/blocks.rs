//! Block metadata
//!
//! The static table of blocks exposed to the editor, grouped by category. Each
//! block names an [Opcode] and describes its arguments with defaults and
//! optional menus. [BlockTable::load] checks the table against the opcode
//! schema once, so a mismatch fails at startup instead of on first use.

use std::collections::HashSet;

use log::debug;

use crate::{
    codec::ArgType,
    command::{BlockKind, CommandRequest, Opcode},
    error::Error,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MenuItem {
    pub label: &'static str,
    pub value: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Menu {
    pub name: &'static str,
    pub items: &'static [MenuItem],
}

impl Menu {
    /// Resolve a menu selection by value, or by label ignoring case
    pub fn resolve(&self, selection: &str) -> Option<&'static str> {
        self.items
            .iter()
            .find(|item| item.value == selection)
            .or_else(|| {
                self.items
                    .iter()
                    .find(|item| item.label.eq_ignore_ascii_case(selection))
            })
            .map(|item| item.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockArg {
    pub name: &'static str,
    pub ty: ArgType,
    pub default: &'static str,
    pub menu: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub opcode: &'static str,
    pub kind: BlockKind,
    pub text: &'static str,
    pub args: &'static [BlockArg],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Category {
    pub id: &'static str,
    pub name: &'static str,
    pub blocks: &'static [Block],
}

const fn arg(name: &'static str, ty: ArgType, default: &'static str) -> BlockArg {
    BlockArg {
        name,
        ty,
        default,
        menu: None,
    }
}

const fn menu_arg(
    name: &'static str,
    ty: ArgType,
    default: &'static str,
    menu: &'static str,
) -> BlockArg {
    BlockArg {
        name,
        ty,
        default,
        menu: Some(menu),
    }
}

const fn command(opcode: &'static str, text: &'static str, args: &'static [BlockArg]) -> Block {
    Block {
        opcode,
        kind: BlockKind::Command,
        text,
        args,
    }
}

const fn reporter(opcode: &'static str, text: &'static str) -> Block {
    Block {
        opcode,
        kind: BlockKind::Reporter,
        text,
        args: &[],
    }
}

const fn item(label: &'static str, value: &'static str) -> MenuItem {
    MenuItem { label, value }
}

pub static CATEGORIES: &[Category] = &[
    Category {
        id: "screen",
        name: "Screen",
        blocks: &[
            command("screenInit", "init screen", &[]),
            command(
                "screenRotate",
                "rotate screen to [ANGLE] degrees",
                &[arg("ANGLE", ArgType::Angle, "0")],
            ),
            command(
                "screenMirror",
                "set screen mirror mode [MODE]",
                &[menu_arg("MODE", ArgType::Number, "0", "mirrorMode")],
            ),
            command(
                "screenShow",
                "fill screen with [COLOR]",
                &[menu_arg("COLOR", ArgType::Text, "RED", "color")],
            ),
            command(
                "screenSet",
                "fill screen with R [R] G [G] B [B]",
                &[
                    arg("R", ArgType::Uint8, "255"),
                    arg("G", ArgType::Uint8, "0"),
                    arg("B", ArgType::Uint8, "0"),
                ],
            ),
            command(
                "screenShowImage",
                "show image [IMAGE] on screen",
                &[arg("IMAGE", ArgType::Text, "your_image_path")],
            ),
            command("screenClear", "clear screen", &[]),
        ],
    },
    Category {
        id: "image",
        name: "Image",
        blocks: &[
            command(
                "imageInit",
                "set image to [IMAGE]",
                &[arg("IMAGE", ArgType::Text, "image.Image()")],
            ),
            reporter("image", "image"),
            command(
                "imageDrawString",
                "draw [TEXT] at x [X] y [Y] size [SIZE] color [COLOR]",
                &[
                    arg("TEXT", ArgType::Text, "Hello MicroPython!"),
                    arg("X", ArgType::Number, "0"),
                    arg("Y", ArgType::Number, "0"),
                    arg("SIZE", ArgType::Number, "2"),
                    arg("COLOR", ArgType::Color, ""),
                ],
            ),
            command(
                "imageDrawRectangle",
                "draw rectangle x [X] y [Y] w [W] h [H] color [COLOR] thickness [THICKNESS] [FILL]",
                &[
                    arg("X", ArgType::Number, "0"),
                    arg("Y", ArgType::Number, "0"),
                    arg("W", ArgType::Number, "10"),
                    arg("H", ArgType::Number, "10"),
                    arg("COLOR", ArgType::Color, ""),
                    arg("THICKNESS", ArgType::Number, "1"),
                    menu_arg("FILL", ArgType::Number, "1", "fill"),
                ],
            ),
        ],
    },
    Category {
        id: "sensor",
        name: "Sensor",
        blocks: &[
            command(
                "sensorinit",
                "init camera format [PIX] size [SIZE] skip [SKIPFRAME] frames",
                &[
                    menu_arg("PIX", ArgType::Text, "RGB565", "pix"),
                    menu_arg("SIZE", ArgType::Text, "QVGA", "size"),
                    arg("SKIPFRAME", ArgType::Number, "100"),
                ],
            ),
            reporter("snapshot", "snapshot"),
        ],
    },
    Category {
        id: "console",
        name: "Console",
        blocks: &[
            command("consoleTimeClock", "create clock", &[]),
            command("consoleTimeTick", "tick clock", &[]),
            reporter("consoleFps", "frames per second"),
            command(
                "consolePrint",
                "print [TEXT]",
                &[arg("TEXT", ArgType::Text, "Hello MicroPython!")],
            ),
            command(
                "consoleExecfile",
                "run file [TEXT]",
                &[arg("TEXT", ArgType::Text, "your_python_code.py")],
            ),
            command("consoleReboot", "reboot", &[]),
        ],
    },
];

pub static MENUS: &[Menu] = &[
    Menu {
        name: "mirrorMode",
        items: &[item("Normal", "0"), item("Flip", "1")],
    },
    Menu {
        name: "color",
        items: &[
            item("Red", "RED"),
            item("Green", "GREEN"),
            item("Blue", "BLUE"),
            item("Purple", "PURPLE"),
            item("Yellow", "YELLOW"),
            item("Cyan", "CYAN"),
            item("White", "WHITE"),
            item("Black", "BLACK"),
        ],
    },
    Menu {
        name: "fill",
        items: &[item("Empty", "0"), item("Solid", "1")],
    },
    Menu {
        name: "pix",
        items: &[item("RGB565", "RGB565"), item("Grayscale", "GRAYSCALE")],
    },
    Menu {
        name: "size",
        items: &[item("QVGA (320x240)", "QVGA"), item("QQVGA (160x120)", "QQVGA")],
    },
];

/// A block together with the opcode it was validated against
#[derive(Debug, Clone, Copy)]
pub struct Entry {
    pub category: &'static Category,
    pub block: &'static Block,
    pub opcode: Opcode,
}

/// The validated block table
#[derive(Debug, Clone)]
pub struct BlockTable {
    entries: Vec<Entry>,
    menus: &'static [Menu],
}

impl BlockTable {
    /// Load and validate the built-in block table
    pub fn load() -> Result<Self, Error> {
        Self::from_tables(CATEGORIES, MENUS)
    }

    pub(crate) fn from_tables(
        categories: &'static [Category],
        menus: &'static [Menu],
    ) -> Result<Self, Error> {
        let invalid = |reason: String| Error::InvalidBlockTable(reason);

        let mut entries = Vec::new();
        let mut seen = HashSet::new();

        for category in categories {
            for block in category.blocks {
                let opcode = Opcode::from_name(block.opcode)
                    .map_err(|_| invalid(format!("unknown opcode `{}`", block.opcode)))?;

                if !seen.insert(opcode) {
                    return Err(invalid(format!("opcode `{opcode}` is declared twice")));
                }
                if block.kind != opcode.kind() {
                    return Err(invalid(format!(
                        "`{opcode}` is declared as a {} but the device treats it as a {}",
                        block.kind,
                        opcode.kind()
                    )));
                }

                validate_args(opcode, block, menus)?;

                entries.push(Entry {
                    category,
                    block,
                    opcode,
                });
            }
        }

        if let Some(missing) = Opcode::all().find(|op| !seen.contains(op)) {
            return Err(invalid(format!("no block declared for opcode `{missing}`")));
        }

        debug!("Loaded {} blocks", entries.len());

        Ok(BlockTable { entries, menus })
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn menus(&self) -> &[Menu] {
        self.menus
    }

    pub fn menu(&self, name: &str) -> Option<&Menu> {
        self.menus.iter().find(|menu| menu.name == name)
    }

    pub fn get(&self, opcode: Opcode) -> Option<&Entry> {
        self.entries.iter().find(|entry| entry.opcode == opcode)
    }

    /// Build a request for a block from named arguments
    ///
    /// Arguments not given fall back to the block's defaults. Menu arguments
    /// accept either the item value or its label.
    pub fn request(&self, name: &str, args: &[(&str, &str)]) -> Result<CommandRequest, Error> {
        let opcode = Opcode::from_name(name)?;
        let entry = self
            .get(opcode)
            .ok_or_else(|| Error::UnsupportedOperation(name.to_string()))?;

        let invalid = |reason: String| Error::InvalidArguments {
            opcode: opcode.to_string(),
            reason,
        };

        if let Some((unknown, _)) = args
            .iter()
            .find(|(key, _)| !entry.block.args.iter().any(|arg| arg.name == *key))
        {
            return Err(invalid(format!("unknown argument `{unknown}`")));
        }

        let mut values = Vec::with_capacity(entry.block.args.len());
        for block_arg in entry.block.args {
            let raw = args
                .iter()
                .rev()
                .find(|(key, _)| *key == block_arg.name)
                .map_or(block_arg.default, |(_, value)| *value);

            let raw = match block_arg.menu.and_then(|name| self.menu(name)) {
                Some(menu) => menu.resolve(raw).ok_or_else(|| {
                    invalid(format!(
                        "`{raw}` is not an item of the `{}` menu",
                        menu.name
                    ))
                })?,
                None => raw,
            };

            let value = block_arg
                .ty
                .parse(raw)
                .map_err(|reason| invalid(format!("{}: {reason}", block_arg.name)))?;
            values.push(value);
        }

        let request = CommandRequest::new(opcode, values);
        request.validate()?;

        Ok(request)
    }
}

fn validate_args(opcode: Opcode, block: &Block, menus: &[Menu]) -> Result<(), Error> {
    let invalid = |reason: String| Error::InvalidBlockTable(format!("`{opcode}`: {reason}"));
    let params = opcode.params();

    if block.args.len() != params.len() {
        return Err(invalid(format!(
            "declares {} arguments, the device expects {}",
            block.args.len(),
            params.len()
        )));
    }

    for (block_arg, param) in block.args.iter().zip(params) {
        if block_arg.name != param.name || block_arg.ty != param.ty {
            return Err(invalid(format!(
                "argument {} ({}) does not match {} ({})",
                block_arg.name, block_arg.ty, param.name, param.ty
            )));
        }

        let default = match block_arg.menu {
            Some(name) => {
                let menu = menus
                    .iter()
                    .find(|menu| menu.name == name)
                    .ok_or_else(|| invalid(format!("unknown menu `{name}`")))?;
                menu.resolve(block_arg.default).ok_or_else(|| {
                    invalid(format!(
                        "default `{}` is not an item of `{name}`",
                        block_arg.default
                    ))
                })?
            }
            None => block_arg.default,
        };

        block_arg.ty.parse(default).map_err(|reason| {
            invalid(format!("default of {} is invalid: {reason}", block_arg.name))
        })?;
    }

    Ok(())
}
