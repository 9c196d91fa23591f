//! The module text-body parser.
//!
//! The command grammar embeds module definitions; this parser covers the
//! structural subset the driver needs: entity declarations, imports and
//! exports, segments, and the start function. Function bodies are kept as
//! source ranges, not decoded into instructions.
//!
//! Syntax errors are recorded as plain messages (a module that trips them
//! is *malformed*); the post-parse validation pass records messages
//! prefixed `"validation error: "` (a module that only trips those is
//! *invalid*).

use crate::cursor::{CursorState, ParseState};
use crate::error::{ParseAbort, ParseResult, UnresolvedError};
use crate::lexer::{atom_text, lex};
use crate::literals::{parse_f32, parse_f64, parse_i32, parse_i64, parse_u32, parse_v128};
use crate::token::TokenKind;
use breakwater_types::{
    DataSegmentIr, ElemSegmentIr, Export, ExternKind, Features, FunctionDef, FunctionType,
    GlobalDef, GlobalType, Import, ImportDesc, InitExpr, MemoryType, ModuleIr, Mutability, Pages,
    SourceRange, TableType, Type, WASM_PAGE_SIZE,
};
use std::collections::HashMap;

/// An index-space reference: numeric, or by `$name` (resolved after the
/// whole body is parsed, so definitions may follow uses).
#[derive(Clone, Debug)]
enum RawRef {
    Index(u32),
    Name(String),
}

struct PendingRef {
    target: RawRef,
    offset: u32,
}

#[derive(Default)]
struct NameMaps {
    types: HashMap<String, u32>,
    functions: HashMap<String, u32>,
    tables: HashMap<String, u32>,
    memories: HashMap<String, u32>,
    globals: HashMap<String, u32>,
    exception_types: HashMap<String, u32>,
}

#[derive(Default)]
struct ModuleParseContext {
    names: NameMaps,
    num_functions: u32,
    num_tables: u32,
    num_memories: u32,
    num_globals: u32,
    num_exception_types: u32,
    // Exports and the start function may reference entities by name before
    // they are defined; they are fixed up after the body is parsed.
    pending_exports: Vec<(usize, PendingRef)>,
    pending_start: Option<PendingRef>,
    pending_elem_functions: Vec<(usize, usize, PendingRef)>,
}

fn word_at<'s>(cursor: &CursorState<'_, 's>, ahead: usize) -> Option<&'s str> {
    let token = cursor.peek(ahead);
    (token.kind == TokenKind::Word).then(|| atom_text(cursor.parse_state.source, token.begin))
}

fn parse_raw_ref(cursor: &mut CursorState<'_, '_>) -> ParseResult<PendingRef> {
    let offset = cursor.next_token().begin;
    match cursor.next_token().kind {
        TokenKind::Int => Ok(PendingRef {
            target: RawRef::Index(parse_u32(cursor)?),
            offset,
        }),
        TokenKind::Name => {
            let name = cursor.try_parse_name().unwrap();
            Ok(PendingRef {
                target: RawRef::Name(name),
                offset,
            })
        }
        _ => {
            cursor.error_at_next("expected an index or $name");
            Err(ParseAbort::Recover)
        }
    }
}

fn parse_value_type(cursor: &mut CursorState<'_, '_>) -> ParseResult<Type> {
    let text = cursor.next_text();
    let ty = match text {
        "i32" => Type::I32,
        "i64" => Type::I64,
        "f32" => Type::F32,
        "f64" => Type::F64,
        "v128" => Type::V128,
        "funcref" | "anyfunc" => Type::FuncRef,
        "nullref" => Type::NullRef,
        _ => {
            cursor.error_at_next("expected a value type");
            return Err(ParseAbort::Recover);
        }
    };
    cursor.advance();
    Ok(ty)
}

// (param $name? t*) and (result t*) lists.
fn parse_params_and_results(
    cursor: &mut CursorState<'_, '_>,
) -> ParseResult<(Vec<Type>, Vec<Type>)> {
    let mut params = Vec::new();
    let mut results = Vec::new();
    loop {
        if cursor.next_token().kind != TokenKind::LeftParenthesis {
            break;
        }
        match word_at(cursor, 1) {
            Some("param") => {
                cursor.parse_parenthesized(|cursor| {
                    cursor.advance();
                    if cursor.try_parse_name().is_some() {
                        params.push(parse_value_type(cursor)?);
                    } else {
                        while cursor.next_token().kind != TokenKind::RightParenthesis {
                            params.push(parse_value_type(cursor)?);
                        }
                    }
                    Ok(())
                })?;
            }
            Some("result") => {
                cursor.parse_parenthesized(|cursor| {
                    cursor.advance();
                    while cursor.next_token().kind != TokenKind::RightParenthesis {
                        results.push(parse_value_type(cursor)?);
                    }
                    Ok(())
                })?;
            }
            _ => break,
        }
    }
    Ok((params, results))
}

fn intern_function_type(module: &mut ModuleIr, ty: FunctionType) -> u32 {
    if let Some(index) = module.types.iter().position(|existing| *existing == ty) {
        index as u32
    } else {
        module.types.push(ty);
        (module.types.len() - 1) as u32
    }
}

// A type use: `(type idx)?` followed by `(param ..)* (result ..)*`.
fn parse_typeuse(
    cursor: &mut CursorState<'_, '_>,
    module: &mut ModuleIr,
    context: &mut ModuleParseContext,
) -> ParseResult<u32> {
    if cursor.next_token().kind == TokenKind::LeftParenthesis
        && cursor.peek(1).kind == TokenKind::Type
    {
        let type_index = cursor.parse_parenthesized(|cursor| {
            cursor.advance();
            let reference = parse_raw_ref(cursor)?;
            match reference.target {
                RawRef::Index(index) => Ok(index),
                RawRef::Name(name) => match context.names.types.get(&name) {
                    Some(index) => Ok(*index),
                    None => {
                        cursor
                            .parse_state
                            .error(reference.offset, format!("unknown type ${name}"));
                        Err(ParseAbort::Recover)
                    }
                },
            }
        })?;
        // A redundant param/result list may repeat the referenced type.
        parse_params_and_results(cursor)?;
        Ok(type_index)
    } else {
        let (params, results) = parse_params_and_results(cursor)?;
        Ok(intern_function_type(
            module,
            FunctionType::new(params, results),
        ))
    }
}

// Skips the tokens up to (but not through) the `)` that closes the current
// form, returning the covered source range.
fn skip_body_tokens(cursor: &mut CursorState<'_, '_>) -> ParseResult<SourceRange> {
    let begin = cursor.next_token().begin;
    let mut depth = 0u32;
    loop {
        match cursor.next_token().kind {
            TokenKind::Eof => {
                cursor.error_at_next("unexpected end of input in function body");
                return Err(ParseAbort::Fatal);
            }
            TokenKind::LeftParenthesis => {
                depth += 1;
                cursor.advance();
            }
            TokenKind::RightParenthesis => {
                if depth == 0 {
                    return Ok(SourceRange {
                        begin,
                        end: cursor.next_token().begin,
                    });
                }
                depth -= 1;
                cursor.advance();
            }
            _ => {
                cursor.advance();
            }
        }
    }
}

// `(export "name")*` inline in an entity definition.
fn parse_inline_exports(
    cursor: &mut CursorState<'_, '_>,
    module: &mut ModuleIr,
    kind: ExternKind,
    index: u32,
) -> ParseResult<()> {
    while cursor.next_token().kind == TokenKind::LeftParenthesis
        && cursor.peek(1).kind == TokenKind::Export
    {
        let name = cursor.parse_parenthesized(|cursor| {
            cursor.advance();
            cursor.parse_utf8_string()
        })?;
        module.exports.push(Export { name, kind, index });
    }
    Ok(())
}

// `(import "module" "name")` inline in an entity definition.
fn parse_inline_import(
    cursor: &mut CursorState<'_, '_>,
) -> ParseResult<Option<(String, String)>> {
    if cursor.next_token().kind == TokenKind::LeftParenthesis
        && cursor.peek(1).kind == TokenKind::Import
    {
        let names = cursor.parse_parenthesized(|cursor| {
            cursor.advance();
            let module_name = cursor.parse_utf8_string()?;
            let export_name = cursor.parse_utf8_string()?;
            Ok((module_name, export_name))
        })?;
        Ok(Some(names))
    } else {
        Ok(None)
    }
}

fn parse_limits(cursor: &mut CursorState<'_, '_>) -> ParseResult<(u32, Option<u32>)> {
    let minimum = parse_u32(cursor)?;
    let maximum = if cursor.next_token().kind == TokenKind::Int {
        Some(parse_u32(cursor)?)
    } else {
        None
    };
    Ok((minimum, maximum))
}

fn parse_init_expr(cursor: &mut CursorState<'_, '_>) -> ParseResult<InitExpr> {
    cursor.parse_parenthesized(|cursor| match cursor.next_token().kind {
        TokenKind::I32Const => {
            cursor.advance();
            Ok(InitExpr::I32Const(parse_i32(cursor)?))
        }
        TokenKind::I64Const => {
            cursor.advance();
            Ok(InitExpr::I64Const(parse_i64(cursor)?))
        }
        TokenKind::F32Const => {
            cursor.advance();
            Ok(InitExpr::F32Const(parse_f32(cursor)?.to_bits()))
        }
        TokenKind::F64Const => {
            cursor.advance();
            Ok(InitExpr::F64Const(parse_f64(cursor)?.to_bits()))
        }
        TokenKind::V128Const => {
            cursor.advance();
            Ok(InitExpr::V128Const(parse_v128(cursor)?))
        }
        TokenKind::RefNull => {
            cursor.advance();
            Ok(InitExpr::RefNull)
        }
        TokenKind::Word if cursor.next_text() == "global.get" || cursor.next_text() == "get_global" => {
            cursor.advance();
            Ok(InitExpr::GlobalGet(parse_u32(cursor)?))
        }
        TokenKind::Word if cursor.next_text() == "ref.func" => {
            cursor.advance();
            Ok(InitExpr::RefFunc(parse_u32(cursor)?))
        }
        TokenKind::Word if cursor.next_text() == "offset" => {
            cursor.advance();
            parse_init_expr(cursor)
        }
        _ => {
            cursor.error_at_next("expected a constant initializer expression");
            Err(ParseAbort::Recover)
        }
    })
}

fn starts_init_expr(cursor: &CursorState<'_, '_>) -> bool {
    if cursor.next_token().kind != TokenKind::LeftParenthesis {
        return false;
    }
    matches!(
        cursor.peek(1).kind,
        TokenKind::I32Const
            | TokenKind::I64Const
            | TokenKind::F32Const
            | TokenKind::F64Const
            | TokenKind::V128Const
            | TokenKind::RefNull
    ) || matches!(
        word_at(cursor, 1),
        Some("offset") | Some("global.get") | Some("get_global") | Some("ref.func")
    )
}

fn register_name(map: &mut HashMap<String, u32>, name: Option<String>, index: u32) {
    if let Some(name) = name {
        map.insert(name, index);
    }
}

fn parse_func(
    cursor: &mut CursorState<'_, '_>,
    module: &mut ModuleIr,
    context: &mut ModuleParseContext,
) -> ParseResult<()> {
    let index = context.num_functions;
    let name = cursor.try_parse_name();
    register_name(&mut context.names.functions, name, index);
    parse_inline_exports(cursor, module, ExternKind::Function, index)?;

    if let Some((import_module, import_name)) = parse_inline_import(cursor)? {
        let type_index = parse_typeuse(cursor, module, context)?;
        module.imports.push(Import {
            module: import_module,
            name: import_name,
            desc: ImportDesc::Function(type_index),
        });
        context.num_functions += 1;
        return Ok(());
    }

    let type_index = parse_typeuse(cursor, module, context)?;
    let body = skip_body_tokens(cursor)?;
    module.functions.push(FunctionDef { type_index, body });
    context.num_functions += 1;
    Ok(())
}

fn parse_memory(
    cursor: &mut CursorState<'_, '_>,
    module: &mut ModuleIr,
    context: &mut ModuleParseContext,
) -> ParseResult<()> {
    let index = context.num_memories;
    let name = cursor.try_parse_name();
    register_name(&mut context.names.memories, name, index);
    parse_inline_exports(cursor, module, ExternKind::Memory, index)?;
    let import = parse_inline_import(cursor)?;

    // (memory (data "..")) fixes the size to the data's page count.
    if import.is_none()
        && cursor.next_token().kind == TokenKind::LeftParenthesis
        && cursor.peek(1).kind == TokenKind::Data
    {
        let mut bytes = Vec::new();
        cursor.parse_parenthesized(|cursor| {
            cursor.advance();
            while cursor.try_parse_string(&mut bytes) {}
            Ok(())
        })?;
        let num_pages = bytes.len().div_ceil(WASM_PAGE_SIZE) as u32;
        module.memories.push(MemoryType::new(
            Pages(num_pages),
            Some(Pages(num_pages)),
            false,
        ));
        module.data_segments.push(DataSegmentIr {
            memory_index: Some(index),
            offset: Some(InitExpr::I32Const(0)),
            data: bytes,
        });
        context.num_memories += 1;
        return Ok(());
    }

    let (minimum, maximum) = parse_limits(cursor)?;
    let shared = if word_at(cursor, 0) == Some("shared") {
        cursor.advance();
        true
    } else {
        false
    };
    let ty = MemoryType::new(Pages(minimum), maximum.map(Pages), shared);

    if let Some((import_module, import_name)) = import {
        module.imports.push(Import {
            module: import_module,
            name: import_name,
            desc: ImportDesc::Memory(ty),
        });
    } else {
        module.memories.push(ty);
    }
    context.num_memories += 1;
    Ok(())
}

fn parse_table(
    cursor: &mut CursorState<'_, '_>,
    module: &mut ModuleIr,
    context: &mut ModuleParseContext,
) -> ParseResult<()> {
    let index = context.num_tables;
    let name = cursor.try_parse_name();
    register_name(&mut context.names.tables, name, index);
    parse_inline_exports(cursor, module, ExternKind::Table, index)?;
    let import = parse_inline_import(cursor)?;

    // (table funcref (elem ..)) fixes the size to the element count.
    if import.is_none() && cursor.next_token().kind != TokenKind::Int {
        let element_type = parse_value_type(cursor)?;
        let elem_index = module.elem_segments.len();
        let mut num_elements = 0u32;
        cursor.parse_parenthesized(|cursor| {
            cursor.require(TokenKind::Elem)?;
            module.elem_segments.push(ElemSegmentIr {
                table_index: Some(index),
                offset: Some(InitExpr::I32Const(0)),
                functions: Vec::new(),
            });
            while matches!(cursor.next_token().kind, TokenKind::Int | TokenKind::Name) {
                let reference = parse_raw_ref(cursor)?;
                module.elem_segments[elem_index].functions.push(u32::MAX);
                context
                    .pending_elem_functions
                    .push((elem_index, num_elements as usize, reference));
                num_elements += 1;
            }
            Ok(())
        })?;
        module
            .tables
            .push(TableType::new(element_type, num_elements, Some(num_elements)));
        context.num_tables += 1;
        return Ok(());
    }

    let (minimum, maximum) = parse_limits(cursor)?;
    let element_type = parse_value_type(cursor)?;
    let ty = TableType::new(element_type, minimum, maximum);

    if let Some((import_module, import_name)) = import {
        module.imports.push(Import {
            module: import_module,
            name: import_name,
            desc: ImportDesc::Table(ty),
        });
    } else {
        module.tables.push(ty);
    }
    context.num_tables += 1;
    Ok(())
}

fn parse_global_type(cursor: &mut CursorState<'_, '_>) -> ParseResult<GlobalType> {
    if cursor.next_token().kind == TokenKind::LeftParenthesis && word_at(cursor, 1) == Some("mut") {
        cursor.parse_parenthesized(|cursor| {
            cursor.advance();
            Ok(GlobalType::new(parse_value_type(cursor)?, Mutability::Var))
        })
    } else {
        Ok(GlobalType::new(parse_value_type(cursor)?, Mutability::Const))
    }
}

fn parse_global(
    cursor: &mut CursorState<'_, '_>,
    module: &mut ModuleIr,
    context: &mut ModuleParseContext,
) -> ParseResult<()> {
    let index = context.num_globals;
    let name = cursor.try_parse_name();
    register_name(&mut context.names.globals, name, index);
    parse_inline_exports(cursor, module, ExternKind::Global, index)?;
    let import = parse_inline_import(cursor)?;

    let ty = parse_global_type(cursor)?;

    if let Some((import_module, import_name)) = import {
        module.imports.push(Import {
            module: import_module,
            name: import_name,
            desc: ImportDesc::Global(ty),
        });
        context.num_globals += 1;
        return Ok(());
    }

    let init = if cursor.next_token().kind == TokenKind::LeftParenthesis {
        Some(parse_init_expr(cursor)?)
    } else {
        None
    };
    module.globals.push(GlobalDef { ty, init });
    context.num_globals += 1;
    Ok(())
}

fn parse_exception_type_def(
    cursor: &mut CursorState<'_, '_>,
    module: &mut ModuleIr,
    context: &mut ModuleParseContext,
) -> ParseResult<()> {
    let index = context.num_exception_types;
    let name = cursor.try_parse_name();
    register_name(&mut context.names.exception_types, name, index);
    parse_inline_exports(cursor, module, ExternKind::ExceptionType, index)?;
    let import = parse_inline_import(cursor)?;

    let (params, results) = parse_params_and_results(cursor)?;
    if !results.is_empty() {
        cursor.error_at_next("exception types cannot have results");
    }
    let sig = breakwater_types::ExceptionTypeSig::new(params);

    if let Some((import_module, import_name)) = import {
        module.imports.push(Import {
            module: import_module,
            name: import_name,
            desc: ImportDesc::ExceptionType(sig),
        });
    } else {
        module.exception_types.push(sig);
    }
    context.num_exception_types += 1;
    Ok(())
}

fn parse_type_def(
    cursor: &mut CursorState<'_, '_>,
    module: &mut ModuleIr,
    context: &mut ModuleParseContext,
) -> ParseResult<()> {
    let name = cursor.try_parse_name();
    register_name(&mut context.names.types, name, module.types.len() as u32);
    let ty = cursor.parse_parenthesized(|cursor| {
        cursor.require(TokenKind::Func)?;
        let (params, results) = parse_params_and_results(cursor)?;
        Ok(FunctionType::new(params, results))
    })?;
    module.types.push(ty);
    Ok(())
}

fn parse_export_def(
    cursor: &mut CursorState<'_, '_>,
    module: &mut ModuleIr,
    context: &mut ModuleParseContext,
) -> ParseResult<()> {
    let name = cursor.parse_utf8_string()?;
    let (kind, reference) = cursor.parse_parenthesized(|cursor| {
        let kind = match cursor.next_token().kind {
            TokenKind::Func => ExternKind::Function,
            TokenKind::Table => ExternKind::Table,
            TokenKind::Memory => ExternKind::Memory,
            TokenKind::Global => ExternKind::Global,
            TokenKind::ExceptionType => ExternKind::ExceptionType,
            _ => {
                cursor.error_at_next("expected an exportable definition kind");
                return Err(ParseAbort::Recover);
            }
        };
        cursor.advance();
        let reference = parse_raw_ref(cursor)?;
        Ok((kind, reference))
    })?;
    let export_index = module.exports.len();
    module.exports.push(Export {
        name,
        kind,
        index: u32::MAX,
    });
    context.pending_exports.push((export_index, reference));
    Ok(())
}

fn parse_import_def(
    cursor: &mut CursorState<'_, '_>,
    module: &mut ModuleIr,
    context: &mut ModuleParseContext,
) -> ParseResult<()> {
    let import_module = cursor.parse_utf8_string()?;
    let import_name = cursor.parse_utf8_string()?;
    let desc = cursor.parse_parenthesized(|cursor| match cursor.next_token().kind {
        TokenKind::Func => {
            cursor.advance();
            let name = cursor.try_parse_name();
            register_name(&mut context.names.functions, name, context.num_functions);
            context.num_functions += 1;
            let type_index = parse_typeuse(cursor, module, context)?;
            Ok(ImportDesc::Function(type_index))
        }
        TokenKind::Memory => {
            cursor.advance();
            let name = cursor.try_parse_name();
            register_name(&mut context.names.memories, name, context.num_memories);
            context.num_memories += 1;
            let (minimum, maximum) = parse_limits(cursor)?;
            let shared = if word_at(cursor, 0) == Some("shared") {
                cursor.advance();
                true
            } else {
                false
            };
            Ok(ImportDesc::Memory(MemoryType::new(
                Pages(minimum),
                maximum.map(Pages),
                shared,
            )))
        }
        TokenKind::Table => {
            cursor.advance();
            let name = cursor.try_parse_name();
            register_name(&mut context.names.tables, name, context.num_tables);
            context.num_tables += 1;
            let (minimum, maximum) = parse_limits(cursor)?;
            let element_type = parse_value_type(cursor)?;
            Ok(ImportDesc::Table(TableType::new(
                element_type,
                minimum,
                maximum,
            )))
        }
        TokenKind::Global => {
            cursor.advance();
            let name = cursor.try_parse_name();
            register_name(&mut context.names.globals, name, context.num_globals);
            context.num_globals += 1;
            Ok(ImportDesc::Global(parse_global_type(cursor)?))
        }
        TokenKind::ExceptionType => {
            cursor.advance();
            let name = cursor.try_parse_name();
            register_name(
                &mut context.names.exception_types,
                name,
                context.num_exception_types,
            );
            context.num_exception_types += 1;
            let (params, _) = parse_params_and_results(cursor)?;
            Ok(ImportDesc::ExceptionType(
                breakwater_types::ExceptionTypeSig::new(params),
            ))
        }
        _ => {
            cursor.error_at_next("expected an importable definition kind");
            Err(ParseAbort::Recover)
        }
    })?;
    module.imports.push(Import {
        module: import_module,
        name: import_name,
        desc,
    });
    Ok(())
}

fn parse_entity_ref_form(
    cursor: &mut CursorState<'_, '_>,
    kind: TokenKind,
) -> ParseResult<Option<PendingRef>> {
    if cursor.next_token().kind == TokenKind::LeftParenthesis && cursor.peek(1).kind == kind {
        let reference = cursor.parse_parenthesized(|cursor| {
            cursor.advance();
            parse_raw_ref(cursor)
        })?;
        Ok(Some(reference))
    } else {
        Ok(None)
    }
}

fn resolve_now(
    cursor: &mut CursorState<'_, '_>,
    reference: PendingRef,
    names: &HashMap<String, u32>,
    what: &str,
) -> Option<u32> {
    match reference.target {
        RawRef::Index(index) => Some(index),
        RawRef::Name(name) => match names.get(&name) {
            Some(index) => Some(*index),
            None => {
                cursor
                    .parse_state
                    .error(reference.offset, format!("unknown {what} ${name}"));
                None
            }
        },
    }
}

fn parse_data_def(
    cursor: &mut CursorState<'_, '_>,
    module: &mut ModuleIr,
    context: &mut ModuleParseContext,
) -> ParseResult<()> {
    cursor.try_parse_name();
    let memory_ref = parse_entity_ref_form(cursor, TokenKind::Memory)?;
    let offset = if starts_init_expr(cursor) {
        Some(parse_init_expr(cursor)?)
    } else {
        None
    };
    let mut data = Vec::new();
    while cursor.try_parse_string(&mut data) {}

    let memory_index = match (memory_ref, &offset) {
        (Some(reference), _) => {
            resolve_now(cursor, reference, &context.names.memories, "memory")
        }
        (None, Some(_)) => Some(0),
        (None, None) => None,
    };
    module.data_segments.push(DataSegmentIr {
        memory_index: if offset.is_some() { memory_index } else { None },
        offset,
        data,
    });
    Ok(())
}

fn parse_elem_def(
    cursor: &mut CursorState<'_, '_>,
    module: &mut ModuleIr,
    context: &mut ModuleParseContext,
) -> ParseResult<()> {
    cursor.try_parse_name();
    let declare = if word_at(cursor, 0) == Some("declare") {
        cursor.advance();
        true
    } else {
        false
    };
    let table_ref = parse_entity_ref_form(cursor, TokenKind::Table)?;
    let offset = if starts_init_expr(cursor) {
        Some(parse_init_expr(cursor)?)
    } else {
        None
    };
    if matches!(word_at(cursor, 0), Some("func") | Some("funcref")) {
        cursor.advance();
    }

    let elem_index = module.elem_segments.len();
    let table_index = match (table_ref, &offset, declare) {
        (_, _, true) | (None, None, _) => None,
        (Some(reference), _, _) => {
            resolve_now(cursor, reference, &context.names.tables, "table")
        }
        (None, Some(_), _) => Some(0),
    };
    module.elem_segments.push(ElemSegmentIr {
        table_index,
        offset: if declare { None } else { offset },
        functions: Vec::new(),
    });

    let mut position = 0usize;
    while matches!(cursor.next_token().kind, TokenKind::Int | TokenKind::Name) {
        let reference = parse_raw_ref(cursor)?;
        module.elem_segments[elem_index].functions.push(u32::MAX);
        context
            .pending_elem_functions
            .push((elem_index, position, reference));
        position += 1;
    }
    Ok(())
}

/// The post-parse validation pass: every message is prefixed
/// `"validation error: "`, which is what separates *invalid* modules from
/// *malformed* ones.
pub fn validate_module(module: &ModuleIr) -> Vec<String> {
    let mut errors = Vec::new();

    if module.index_space_size(ExternKind::Memory) > 1 && !module.features.multi_memory {
        errors.push("validation error: too many memories".to_string());
    }
    if module.index_space_size(ExternKind::Table) > 1 && !module.features.reference_types {
        errors.push("validation error: too many tables".to_string());
    }
    if module.index_space_size(ExternKind::ExceptionType) > 0 && !module.features.exceptions {
        errors.push(
            "validation error: exception types require the exception-handling feature".to_string(),
        );
    }
    for memory in &module.memories {
        if memory.shared && !module.features.threads {
            errors.push("validation error: shared memories require the threads feature".to_string());
        }
        if memory.shared && memory.maximum.is_none() {
            errors.push("validation error: shared memories must have a maximum size".to_string());
        }
    }

    let mut export_names: Vec<&str> = Vec::new();
    for export in &module.exports {
        if export_names.contains(&export.name.as_str()) {
            errors.push(format!("validation error: duplicate export: {}", export.name));
        }
        export_names.push(&export.name);
        let space = module.index_space_size(export.kind);
        if export.index != u32::MAX && (export.index as usize) >= space {
            errors.push(format!(
                "validation error: invalid {} index {}",
                match export.kind {
                    ExternKind::Function => "function",
                    ExternKind::Table => "table",
                    ExternKind::Memory => "memory",
                    ExternKind::Global => "global",
                    ExternKind::ExceptionType => "exception type",
                },
                export.index
            ));
        }
    }

    if let Some(start) = module.start_function {
        if (start as usize) >= module.index_space_size(ExternKind::Function) {
            errors.push(format!("validation error: invalid function index {start}"));
        }
    }

    for function in &module.functions {
        if (function.type_index as usize) >= module.types.len() {
            errors.push(format!(
                "validation error: invalid type index {}",
                function.type_index
            ));
        }
    }

    for segment in &module.elem_segments {
        for function_index in &segment.functions {
            if *function_index != u32::MAX
                && (*function_index as usize) >= module.index_space_size(ExternKind::Function)
            {
                errors.push(format!(
                    "validation error: invalid function index {function_index}"
                ));
            }
        }
    }

    errors
}

fn names_for_kind<'c>(context: &'c ModuleParseContext, kind: ExternKind) -> &'c HashMap<String, u32> {
    match kind {
        ExternKind::Function => &context.names.functions,
        ExternKind::Table => &context.names.tables,
        ExternKind::Memory => &context.names.memories,
        ExternKind::Global => &context.names.globals,
        ExternKind::ExceptionType => &context.names.exception_types,
    }
}

/// Parse a module body (the fields inside `(module ...)`), recording
/// errors into the cursor's parse state.
pub(crate) fn parse_module_body(
    cursor: &mut CursorState<'_, '_>,
    module: &mut ModuleIr,
) -> ParseResult<()> {
    let body_begin = cursor.next_token().begin;
    let mut context = ModuleParseContext::default();

    while cursor.next_token().kind == TokenKind::LeftParenthesis {
        let field_result = cursor.parse_parenthesized(|cursor| {
            let field = cursor.next_token().kind;
            match field {
                TokenKind::Type => {
                    cursor.advance();
                    parse_type_def(cursor, module, &mut context)
                }
                TokenKind::Import => {
                    cursor.advance();
                    parse_import_def(cursor, module, &mut context)
                }
                TokenKind::Func => {
                    cursor.advance();
                    parse_func(cursor, module, &mut context)
                }
                TokenKind::Table => {
                    cursor.advance();
                    parse_table(cursor, module, &mut context)
                }
                TokenKind::Memory => {
                    cursor.advance();
                    parse_memory(cursor, module, &mut context)
                }
                TokenKind::Global => {
                    cursor.advance();
                    parse_global(cursor, module, &mut context)
                }
                TokenKind::ExceptionType => {
                    cursor.advance();
                    parse_exception_type_def(cursor, module, &mut context)
                }
                TokenKind::Export => {
                    cursor.advance();
                    parse_export_def(cursor, module, &mut context)
                }
                TokenKind::Start => {
                    cursor.advance();
                    context.pending_start = Some(parse_raw_ref(cursor)?);
                    Ok(())
                }
                TokenKind::Data => {
                    cursor.advance();
                    parse_data_def(cursor, module, &mut context)
                }
                TokenKind::Elem => {
                    cursor.advance();
                    parse_elem_def(cursor, module, &mut context)
                }
                _ => {
                    cursor.error_at_next("unknown module field");
                    Err(ParseAbort::Recover)
                }
            }
        });
        match field_result {
            // The error is recorded and the cursor sits after the field's
            // closing parenthesis, so the next field can still parse.
            Ok(()) | Err(ParseAbort::Recover) => {}
            Err(ParseAbort::Fatal) => return Err(ParseAbort::Fatal),
        }
    }

    // Fix up references that may point forward.
    let pending_exports = std::mem::take(&mut context.pending_exports);
    for (export_index, reference) in pending_exports {
        let kind = module.exports[export_index].kind;
        if let Some(index) =
            resolve_now(cursor, reference, names_for_kind(&context, kind), "definition")
        {
            module.exports[export_index].index = index;
        }
    }
    let pending_elem_functions = std::mem::take(&mut context.pending_elem_functions);
    for (elem_index, position, reference) in pending_elem_functions {
        if let Some(index) =
            resolve_now(cursor, reference, &context.names.functions, "function")
        {
            module.elem_segments[elem_index].functions[position] = index;
        }
    }
    if let Some(reference) = context.pending_start.take() {
        if let Some(index) =
            resolve_now(cursor, reference, &context.names.functions, "function")
        {
            module.start_function = Some(index);
        }
    }

    for message in validate_module(module) {
        cursor.parse_state.error(body_begin, message);
    }
    Ok(())
}

/// Parse module text: either a whole `(module ...)` form or a bare module
/// body. Returns the module IR summary and the errors recorded while
/// parsing it.
pub fn parse_module_text(source: &str, features: &Features) -> (ModuleIr, Vec<UnresolvedError>) {
    let mut parse_state = ParseState::new(source);
    let tokens = lex(source, &mut parse_state);
    let mut cursor = CursorState::new(&tokens, parse_state);
    let mut module = ModuleIr::new(features.clone());

    let result = if cursor.next_token().kind == TokenKind::LeftParenthesis
        && cursor.peek(1).kind == TokenKind::Module
    {
        cursor.parse_parenthesized(|cursor| {
            cursor.advance();
            cursor.try_parse_name();
            parse_module_body(cursor, &mut module)
        })
    } else {
        parse_module_body(&mut cursor, &mut module)
    };

    if result.is_ok() && cursor.next_token().kind != TokenKind::Eof {
        cursor.error_at_next("unexpected tokens after module");
    }

    (module, cursor.parse_state.unresolved_errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> (ModuleIr, Vec<UnresolvedError>) {
        parse_module_text(source, &Features::default())
    }

    #[test]
    fn minimal_module_with_exported_function() {
        let (module, errors) = parse(r#"(module (func (export "f") (result i32) i32.const 42))"#);
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(module.functions.len(), 1);
        assert_eq!(module.exports.len(), 1);
        assert_eq!(module.exports[0].name, "f");
        assert_eq!(module.exports[0].kind, ExternKind::Function);
        assert_eq!(module.exports[0].index, 0);
        assert_eq!(module.types[0].results(), &[Type::I32]);
    }

    #[test]
    fn imports_and_separate_exports() {
        let (module, errors) = parse(
            r#"(module
                (import "env" "mem" (memory 1 2 shared))
                (import "env" "f" (func $f (param i32) (result i32)))
                (func $g (result i32) i32.const 1)
                (export "g" (func $g))
                (export "f2" (func $f)))"#,
        );
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(module.imports.len(), 2);
        assert_eq!(module.exports[0].index, 1);
        assert_eq!(module.exports[1].index, 0);
    }

    #[test]
    fn multiple_memories_are_a_validation_error() {
        let (_, errors) = parse("(memory 0) (memory 0)");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.starts_with("validation error"), "{errors:?}");
    }

    #[test]
    fn syntax_errors_are_not_validation_errors() {
        let (_, errors) = parse("(memory 0) (menory 0)");
        assert!(!errors.is_empty());
        assert!(errors.iter().any(|e| !e.message.starts_with("validation error")));
    }

    #[test]
    fn tables_globals_and_segments() {
        let (module, errors) = parse(
            r#"(module
                (table $t 1 10 funcref)
                (global $g (mut i32) (i32.const 7))
                (func $f)
                (elem (table $t) (offset (i32.const 0)) func $f)
                (data (memory 0) (i32.const 0) "ab")
                (memory 1))"#,
        );
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(module.tables.len(), 1);
        assert_eq!(module.globals[0].init, Some(InitExpr::I32Const(7)));
        assert_eq!(module.elem_segments[0].functions, vec![0]);
        assert_eq!(module.data_segments[0].data, b"ab");
    }

    #[test]
    fn start_resolves_forward_references() {
        let (module, errors) = parse("(module (start $main) (func $main))");
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(module.start_function, Some(0));
    }

    #[test]
    fn memory_data_abbreviation_sizes_the_memory() {
        let (module, errors) = parse(r#"(module (memory (data "hello")))"#);
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(module.memories[0].minimum, Pages(1));
        assert_eq!(module.memories[0].maximum, Some(Pages(1)));
        assert_eq!(module.data_segments[0].data, b"hello");
    }

    #[test]
    fn unknown_names_are_plain_errors() {
        let (_, errors) = parse("(module (export \"f\" (func $missing)))");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("unknown"));
        assert!(!errors[0].message.starts_with("validation error"));
    }
}
