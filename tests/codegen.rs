//! End-to-end codegen scenarios: build typed ASTs, compile them, and
//! inspect the emitted object files.

use std::rc::Rc;

use ccobj::ast::{BinOp, Node, NodeKind, UnaryOp, VecInfo, VecMode};
use ccobj::types::{struct_type, CType};
use ccobj::{compile_unit, CompileOpts, OptLevel, Target};

// ---- tiny AST builders -----------------------------------------------

fn int_ty() -> Rc<CType> {
    Rc::new(CType::Int)
}

fn lit(v: i64) -> Node {
    Node::with_type(NodeKind::IntLit(v), int_ty(), 1)
}

fn ident(name: &str) -> Node {
    Node::new(NodeKind::Ident(name.into()), 1)
}

fn typed_ident(name: &str, ty: Rc<CType>) -> Node {
    Node::with_type(NodeKind::Ident(name.into()), ty, 1)
}

fn bin(op: BinOp, lhs: Node, rhs: Node) -> Node {
    Node::with_type(
        NodeKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        int_ty(),
        1,
    )
}

fn assign(lhs: Node, rhs: Node) -> Node {
    Node::new(
        NodeKind::Assign {
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        1,
    )
}

fn ret(expr: Node) -> Node {
    Node::new(NodeKind::Return(Some(Box::new(expr))), 1)
}

fn decl(name: &str, ty: Rc<CType>, init: Option<Node>) -> Node {
    Node::with_type(
        NodeKind::VarDecl {
            name: name.into(),
            is_static: false,
            is_extern: false,
            init: init.map(Box::new),
        },
        ty,
        1,
    )
}

fn block(stmts: Vec<Node>) -> Node {
    Node::new(NodeKind::Block(stmts), 1)
}

fn function(name: &str, params: Vec<Node>, ret_ty: Option<Rc<CType>>, body: Vec<Node>) -> Node {
    let mut node = Node::new(
        NodeKind::Function {
            name: name.into(),
            params,
            body: Box::new(block(body)),
            is_static: false,
        },
        1,
    );
    node.ty = ret_ty;
    node
}

fn call(name: &str, args: Vec<Node>) -> Node {
    Node::with_type(
        NodeKind::Call {
            func: name.into(),
            args,
        },
        int_ty(),
        1,
    )
}

fn opts(opt: OptLevel) -> CompileOpts {
    let _ = env_logger::builder().is_test(true).try_init();
    CompileOpts {
        opt,
        source_file: "test.c".into(),
        comp_dir: "/tmp".into(),
        ..CompileOpts::default()
    }
}

// ---- minimal ELF reader ----------------------------------------------

fn u16_at(b: &[u8], o: usize) -> u16 {
    u16::from_le_bytes(b[o..o + 2].try_into().unwrap())
}

fn u32_at(b: &[u8], o: usize) -> u32 {
    u32::from_le_bytes(b[o..o + 4].try_into().unwrap())
}

fn u64_at(b: &[u8], o: usize) -> u64 {
    u64::from_le_bytes(b[o..o + 8].try_into().unwrap())
}

struct Elf<'a> {
    bytes: &'a [u8],
    shoff: usize,
    shnum: usize,
    shstr_off: usize,
}

impl<'a> Elf<'a> {
    fn parse(bytes: &'a [u8]) -> Elf<'a> {
        assert_eq!(&bytes[0..4], b"\x7fELF", "not an ELF file");
        let shoff = u64_at(bytes, 0x28) as usize;
        let shnum = u16_at(bytes, 0x3c) as usize;
        let shstrndx = u16_at(bytes, 0x3e) as usize;
        let shstr_off = u64_at(bytes, shoff + shstrndx * 64 + 24) as usize;
        Elf {
            bytes,
            shoff,
            shnum,
            shstr_off,
        }
    }

    fn section_name(&self, index: usize) -> &'a str {
        let sh = self.shoff + index * 64;
        let name_off = self.shstr_off + u32_at(self.bytes, sh) as usize;
        let end = self.bytes[name_off..]
            .iter()
            .position(|&b| b == 0)
            .unwrap();
        std::str::from_utf8(&self.bytes[name_off..name_off + end]).unwrap()
    }

    fn section(&self, name: &str) -> Option<(usize, &'a [u8])> {
        for index in 0..self.shnum {
            if self.section_name(index) == name {
                let sh = self.shoff + index * 64;
                let offset = u64_at(self.bytes, sh + 24) as usize;
                let size = u64_at(self.bytes, sh + 32) as usize;
                // SHT_NOBITS sections occupy no file bytes.
                let start = offset.min(self.bytes.len());
                let end = (offset + size).min(self.bytes.len());
                return Some((index, &self.bytes[start..end]));
            }
        }
        None
    }

    fn text(&self) -> &'a [u8] {
        self.section(".text").expect("has .text").1
    }

    /// (name, bind, shndx, value) for every symtab entry past the null.
    fn symbols(&self) -> Vec<(String, u8, u16, u64)> {
        let (index, symtab) = self.section(".symtab").expect("has .symtab");
        let sh = self.shoff + index * 64;
        let strtab_index = u32_at(self.bytes, sh + 40) as usize;
        let strtab_off = u64_at(self.bytes, self.shoff + strtab_index * 64 + 24) as usize;
        let mut out = Vec::new();
        for slot in 1..symtab.len() / 24 {
            let entry = &symtab[slot * 24..slot * 24 + 24];
            let name_off = strtab_off + u32_at(entry, 0) as usize;
            let end = self.bytes[name_off..]
                .iter()
                .position(|&b| b == 0)
                .unwrap();
            let name = std::str::from_utf8(&self.bytes[name_off..name_off + end]).unwrap();
            out.push((
                name.to_string(),
                entry[4] >> 4,
                u16_at(entry, 6),
                u64_at(entry, 8),
            ));
        }
        out
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

// ---- scenarios -------------------------------------------------------

/// int main() { return 2 + 3*4; }
fn arithmetic_unit() -> Vec<Node> {
    vec![function(
        "main",
        vec![],
        Some(int_ty()),
        vec![ret(bin(
            BinOp::Add,
            lit(2),
            bin(BinOp::Mul, lit(3), lit(4)),
        ))],
    )]
}

#[test]
fn arithmetic_folds_to_fourteen() {
    for opt in [OptLevel::O0, OptLevel::O1, OptLevel::O2] {
        let bytes = compile_unit(&arithmetic_unit(), Target::LinuxX64, opts(opt)).unwrap();
        let elf = Elf::parse(&bytes);
        // Constant folding produced `mov $14, %eax`.
        assert!(
            contains(elf.text(), &[0xb8, 14, 0, 0, 0]),
            "no mov $14 at {:?}",
            opt
        );
        let symbols = elf.symbols();
        let main = symbols.iter().find(|s| s.0 == "main").expect("main symbol");
        assert_eq!(main.1, 1, "main is global");
    }
}

/// int f(int n){int s=0;for(int i=0;i<n;i++)if(i%2)s+=i;return s;}
/// int main(){return f(10);}
fn loop_unit() -> Vec<Node> {
    let body = vec![
        decl("s", int_ty(), Some(lit(0))),
        Node::new(
            NodeKind::For {
                init: Some(Box::new(decl("i", int_ty(), Some(lit(0))))),
                cond: Some(Box::new(bin(BinOp::Lt, ident("i"), ident("n")))),
                step: Some(Box::new(Node::new(
                    NodeKind::Unary {
                        op: UnaryOp::PostInc,
                        expr: Box::new(ident("i")),
                    },
                    1,
                ))),
                body: Box::new(Node::new(
                    NodeKind::If {
                        cond: Box::new(bin(BinOp::Mod, ident("i"), lit(2))),
                        then: Box::new(assign(
                            ident("s"),
                            bin(BinOp::Add, ident("s"), ident("i")),
                        )),
                        els: None,
                    },
                    1,
                )),
            },
            1,
        ),
        ret(ident("s")),
    ];
    vec![
        function(
            "f",
            vec![decl("n", int_ty(), None)],
            Some(int_ty()),
            body,
        ),
        function("main", vec![], Some(int_ty()), vec![ret(call("f", vec![lit(10)]))]),
    ]
}

#[test]
fn loop_and_branch_compile() {
    for opt in [OptLevel::O0, OptLevel::O2] {
        let bytes = compile_unit(&loop_unit(), Target::LinuxX64, opts(opt)).unwrap();
        let elf = Elf::parse(&bytes);
        // i % 2 emits sign-extend + divide, remainder read from edx.
        assert!(contains(elf.text(), &[0x99, 0xf7, 0xf9]), "no cdq/idiv at {:?}", opt);
        let symbols = elf.symbols();
        assert!(symbols.iter().any(|s| s.0 == "f"));
        assert!(symbols.iter().any(|s| s.0 == "main"));
    }
}

/// struct P { int x, y; }; with pointer access through q.
fn struct_unit() -> Vec<Node> {
    let p_ty = struct_type("P", &[("x", int_ty()), ("y", int_ty())]);
    let q_ty = Rc::new(CType::Pointer(p_ty.clone()));
    let member = |base: Node, name: &str, arrow: bool| {
        Node::with_type(
            NodeKind::Member {
                base: Box::new(base),
                member: name.into(),
                arrow,
            },
            int_ty(),
            1,
        )
    };
    let body = vec![
        decl("p", p_ty.clone(), None),
        assign(member(typed_ident("p", p_ty.clone()), "x", false), lit(3)),
        assign(member(typed_ident("p", p_ty.clone()), "y", false), lit(4)),
        decl(
            "q",
            q_ty.clone(),
            Some(Node::with_type(
                NodeKind::Unary {
                    op: UnaryOp::AddrOf,
                    expr: Box::new(typed_ident("p", p_ty.clone())),
                },
                q_ty.clone(),
                1,
            )),
        ),
        ret(bin(
            BinOp::Add,
            member(typed_ident("q", q_ty.clone()), "x", true),
            member(typed_ident("q", q_ty), "y", true),
        )),
    ];
    vec![function("main", vec![], Some(int_ty()), body)]
}

#[test]
fn struct_member_offsets() {
    let bytes = compile_unit(&struct_unit(), Target::LinuxX64, opts(OptLevel::O1)).unwrap();
    let elf = Elf::parse(&bytes);
    // Accessing .y adds the member offset of 4 to the base address.
    assert!(contains(elf.text(), &[0x48, 0x83, 0xc0, 0x04]));
}

/// double comparison with short-circuit &&.
fn float_unit() -> Vec<Node> {
    let double_ty = Rc::new(CType::Double);
    let dlit = |v: f64| Node::with_type(NodeKind::FloatLit(v), double_ty.clone(), 1);
    let cmp = |op: BinOp, l: Node, r: Node| {
        Node::with_type(
            NodeKind::Binary {
                op,
                lhs: Box::new(l),
                rhs: Box::new(r),
            },
            int_ty(),
            1,
        )
    };
    let body = vec![
        decl("d", double_ty.clone(), Some(dlit(1.5))),
        Node::new(
            NodeKind::If {
                cond: Box::new(bin(
                    BinOp::LogAnd,
                    cmp(BinOp::Gt, typed_ident("d", double_ty.clone()), dlit(1.0)),
                    cmp(BinOp::Lt, typed_ident("d", double_ty.clone()), dlit(2.0)),
                )),
                then: Box::new(ret(lit(42))),
                els: None,
            },
            2,
        ),
        ret(lit(0)),
    ];
    vec![function("main", vec![], Some(int_ty()), body)]
}

#[test]
fn float_compare_and_convert() {
    let bytes = compile_unit(&float_unit(), Target::LinuxX64, opts(OptLevel::O1)).unwrap();
    let elf = Elf::parse(&bytes);
    // ucomisd appears for the double comparisons.
    assert!(contains(elf.text(), &[0x66, 0x0f, 0x2e]));
    // The 1.5 literal is interned in .data with full double precision.
    let (_, data) = elf.section(".data").expect("has .data");
    assert!(contains(data, &1.5f64.to_bits().to_le_bytes()));
}

/// switch dispatch over x = 2.
fn switch_unit() -> Vec<Node> {
    let body = vec![
        decl("x", int_ty(), Some(lit(2))),
        Node::new(
            NodeKind::Switch {
                cond: Box::new(ident("x")),
                body: Box::new(block(vec![
                    Node::new(NodeKind::Case(1), 3),
                    ret(lit(10)),
                    Node::new(NodeKind::Case(2), 4),
                    ret(lit(20)),
                    Node::new(NodeKind::Default, 5),
                    ret(lit(99)),
                ])),
            },
            2,
        ),
    ];
    vec![function("main", vec![], Some(int_ty()), body)]
}

#[test]
fn switch_compare_chain() {
    for opt in [OptLevel::O0, OptLevel::O2] {
        let bytes = compile_unit(&switch_unit(), Target::LinuxX64, opts(opt)).unwrap();
        let elf = Elf::parse(&bytes);
        let text = elf.text();
        // cmp $1, %eax and cmp $2, %eax dispatch...
        assert!(contains(text, &[0x83, 0xf8, 0x01]), "no cmp $1 at {:?}", opt);
        assert!(contains(text, &[0x83, 0xf8, 0x02]), "no cmp $2 at {:?}", opt);
        // ...and the case-2 arm returns 20.
        assert!(contains(text, &[0xb8, 20, 0, 0, 0]));
    }
}

/// Self-recursive f becomes a tail jump at -O2.
fn tail_call_unit() -> Vec<Node> {
    let body = vec![
        Node::new(
            NodeKind::If {
                cond: Box::new(bin(BinOp::Eq, ident("n"), lit(0))),
                then: Box::new(ret(lit(7))),
                els: None,
            },
            1,
        ),
        ret(call("f", vec![bin(BinOp::Sub, ident("n"), lit(1))])),
    ];
    vec![
        function("f", vec![decl("n", int_ty(), None)], Some(int_ty()), body),
        function(
            "main",
            vec![],
            Some(int_ty()),
            vec![ret(call("f", vec![lit(100000)]))],
        ),
    ]
}

#[test]
fn tail_call_emits_leave_jmp() {
    let bytes = compile_unit(&tail_call_unit(), Target::LinuxX64, opts(OptLevel::O2)).unwrap();
    let elf = Elf::parse(&bytes);
    // leave; jmp replaces call+return in the recursive arm.
    assert!(contains(elf.text(), &[0xc9, 0xe9]));
}

#[test]
fn tail_call_disabled_below_o2() {
    let bytes = compile_unit(&tail_call_unit(), Target::LinuxX64, opts(OptLevel::O1)).unwrap();
    let elf = Elf::parse(&bytes);
    // The recursive arm still uses an ordinary call.
    assert!(!contains(elf.text(), &[0xc9, 0xe9]));
}

#[test]
fn relocations_point_at_placeholders() {
    let bytes = compile_unit(&tail_call_unit(), Target::LinuxX64, opts(OptLevel::O2)).unwrap();
    let elf = Elf::parse(&bytes);
    let text = elf.text();
    let (_, rela) = elf.section(".rela.text").expect("has relocations");
    assert!(!rela.is_empty());
    for entry in rela.chunks(24) {
        let offset = u64_at(entry, 0) as usize;
        assert!(offset + 4 <= text.len());
        // The displacement placeholder is all zeroes.
        assert_eq!(&text[offset..offset + 4], &[0, 0, 0, 0]);
    }
}

#[test]
fn coff_targets() {
    let windows = compile_unit(
        &arithmetic_unit(),
        Target::WindowsX64,
        opts(OptLevel::O1),
    )
    .unwrap();
    assert_eq!(u16_at(&windows, 0), 0x8664);

    let dos = compile_unit(&arithmetic_unit(), Target::DosX86, opts(OptLevel::O1)).unwrap();
    assert_eq!(u16_at(&dos, 0), 0x014c);
    // The 32-bit backend still folded the constant.
    assert!(contains(&dos, &[0xb8, 14, 0, 0, 0]));
}

#[test]
fn debug_section_carries_source_name() {
    let mut o = opts(OptLevel::Og);
    o.debug_info = true;
    let bytes = compile_unit(&loop_unit(), Target::LinuxX64, o).unwrap();
    let elf = Elf::parse(&bytes);
    let (_, debug) = elf.section(".fadors_debug").expect("debug section");
    assert!(contains(debug, b"test.c"));
    assert!(contains(debug, b"/tmp"));
}

#[test]
fn pgo_surface() {
    let mut o = opts(OptLevel::O1);
    o.pgo_generate = true;
    let bytes = compile_unit(&loop_unit(), Target::LinuxX64, o).unwrap();
    let elf = Elf::parse(&bytes);
    let symbols = elf.symbols();
    assert!(symbols.iter().any(|s| s.0 == "__pgo_dump"));
    assert!(symbols.iter().any(|s| s.0 == "__pgo_counters"));
    assert!(symbols.iter().any(|s| s.0 == "fopen"));
    // Counter slots are named per site.
    assert!(symbols.iter().any(|s| s.0.starts_with("__pgo_cnt_")));
}

#[test]
fn vectorized_elementwise_loop() {
    let arr_ty = Rc::new(CType::Array(int_ty(), 16));
    let mut vec_for = Node::new(
        NodeKind::For {
            init: None,
            cond: None,
            step: None,
            body: Box::new(block(vec![])),
        },
        3,
    );
    vec_for.vec_info = Some(VecInfo {
        width: 4,
        elem_size: 4,
        is_float: false,
        op: BinOp::Add,
        iterations: 16,
        dst: "a".into(),
        src1: "b".into(),
        src2: "c".into(),
        accum: None,
        init_scale: 0,
        init_offset: 0,
        mode: VecMode::Elementwise,
    });
    let unit = vec![function(
        "main",
        vec![],
        Some(int_ty()),
        vec![
            decl("a", arr_ty.clone(), None),
            decl("b", arr_ty.clone(), None),
            decl("c", arr_ty, None),
            vec_for,
            ret(lit(0)),
        ],
    )];
    let bytes = compile_unit(&unit, Target::LinuxX64, opts(OptLevel::O2)).unwrap();
    let elf = Elf::parse(&bytes);
    let text = elf.text();
    // movdqu loads and paddd appear in the vector body.
    assert!(contains(text, &[0xf3, 0x0f, 0x6f]));
    assert!(contains(text, &[0x66, 0x0f, 0xfe]));
}

#[test]
fn struct_return_goes_through_memcpy() {
    let big = struct_type(
        "Pair",
        &[("a", Rc::new(CType::LongLong)), ("b", Rc::new(CType::LongLong))],
    );
    let getter = {
        let mut node = function(
            "make",
            vec![],
            Some(big.clone()),
            vec![
                decl("v", big.clone(), None),
                ret(typed_ident("v", big.clone())),
            ],
        );
        node.ty = Some(big.clone());
        node
    };
    let user = function(
        "main",
        vec![],
        Some(int_ty()),
        vec![
            decl("v", big.clone(), None),
            assign(
                typed_ident("v", big.clone()),
                Node::with_type(
                    NodeKind::Call {
                        func: "make".into(),
                        args: vec![],
                    },
                    big,
                    1,
                ),
            ),
            ret(lit(0)),
        ],
    );
    let bytes = compile_unit(&[getter, user], Target::LinuxX64, opts(OptLevel::O1)).unwrap();
    let elf = Elf::parse(&bytes);
    let symbols = elf.symbols();
    let memcpy = symbols.iter().find(|s| s.0 == "memcpy").expect("memcpy");
    assert_eq!(memcpy.2, 0, "memcpy stays undefined");
}

#[test]
fn globals_and_string_literals() {
    let ptr_char = Rc::new(CType::Pointer(Rc::new(CType::Char)));
    let unit = vec![
        {
            let mut g = decl("counter", Rc::new(CType::Long), Some(lit(123)));
            g.line = 1;
            g
        },
        decl(
            "message",
            ptr_char.clone(),
            Some(Node::with_type(
                NodeKind::StrLit("hi there".into()),
                ptr_char,
                1,
            )),
        ),
        function(
            "main",
            vec![],
            Some(int_ty()),
            vec![ret(typed_ident("counter", Rc::new(CType::Long)))],
        ),
    ];
    let bytes = compile_unit(&unit, Target::LinuxX64, opts(OptLevel::O1)).unwrap();
    let elf = Elf::parse(&bytes);
    let (_, data) = elf.section(".data").expect("has .data");
    assert!(contains(data, &123u64.to_le_bytes()));
    assert!(contains(data, b"hi there\0"));
    // The string pointer slot carries an absolute relocation.
    let (_, rela) = elf.section(".rela.data").expect("rela.data");
    assert_eq!(rela.len() % 24, 0);
    assert!(!rela.is_empty());
    let r_type = u32_at(&rela[8..], 0);
    assert_eq!(r_type, 1); // R_X86_64_64
}

#[test]
fn uninitialized_globals_land_in_bss() {
    let unit = vec![
        decl("scratch", Rc::new(CType::Array(int_ty(), 64)), None),
        function("main", vec![], Some(int_ty()), vec![ret(lit(0))]),
    ];
    let bytes = compile_unit(&unit, Target::LinuxX64, opts(OptLevel::O1)).unwrap();
    let elf = Elf::parse(&bytes);
    let (index, _) = elf.section(".bss").expect("has .bss");
    let sh = elf.shoff + index * 64;
    assert_eq!(u64_at(elf.bytes, sh + 32), 256); // sh_size
    let symbols = elf.symbols();
    let scratch = symbols.iter().find(|s| s.0 == "scratch").unwrap();
    assert_eq!(scratch.2 as usize, index);
}
